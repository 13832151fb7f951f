//! Opens the first supported USB serial adapter and prints its modem status.

use std::{
    sync::{Arc, Once},
    thread::sleep,
    time::Duration,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usb_uart::{registry, LineConfig};

const POLLS: usize = 30;

fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

fn main() {
    init_log();

    let devices = rusb::devices().expect("cannot list devices");
    let (dev, kind) = devices
        .iter()
        .find_map(|dev| {
            let desc = dev.device_descriptor().ok()?;
            let kind = registry::lookup(desc.vendor_id(), desc.product_id())?;
            Some((dev, kind))
        })
        .expect("no supported device found");
    println!("Using {kind} device: {dev:?}");

    let hnd = Arc::new(dev.open().expect("cannot open device"));
    let driver = registry::probe(hnd).expect("cannot probe device").expect("device not supported");

    println!("Opening...");
    driver.open().expect("cannot open serial port");
    driver.set_line_config(&LineConfig::default()).expect("cannot set line parameters");
    driver.set_dtr(true).expect("cannot set DTR");
    driver.set_rts(true).expect("cannot set RTS");

    let mut last = None;
    for _ in 0..POLLS {
        let status = driver.modem_status().expect("cannot get modem status");
        if last != Some(status.current) {
            println!("Modem status: {status}");
            last = Some(status.current);
        }

        let mut buf = [0; 64];
        let n = driver.read(&mut buf, Duration::from_millis(100)).expect("read failed");
        if n > 0 {
            println!("Received: {}", String::from_utf8_lossy(&buf[..n]));
        }

        sleep(Duration::from_secs(1));
    }

    println!("Closing...");
    driver.close().expect("cannot close serial port");
}
