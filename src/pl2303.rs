//! Prolific PL2303 driver.
//!
//! The chip pushes modem line changes through an interrupt endpoint.
//! While the port is open a status thread waits on that endpoint and publishes every reported status,
//! see [`Pl2303Driver::status_changes`].
//!
//! Bulk data transfer is not implemented for this chip:
//! on an open port [`read`](UartDriver::read) and [`write`](UartDriver::write) always transfer zero bytes.
//!

use futures::{stream, Stream, StreamExt};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio::sync::{oneshot, oneshot::error::TryRecvError, watch};

use crate::{
    driver::{
        claim_interfaces, not_open, release_interfaces, Endpoints, InterfaceLock, StatusCell, UartCore, UartDriver,
    },
    registry::{VendorProducts, PRODUCT_PL2303, VENDOR_PROLIFIC},
    transport::{EndpointInfo, Transport},
    ModemLines, ModemStatus, Parity, StopBits,
};

const SET_LINE_REQUEST_TYPE: u8 = 0x21;
const SET_LINE_REQUEST: u8 = 0x20;
const SET_CONTROL_REQUEST_TYPE: u8 = 0x21;
const SET_CONTROL_REQUEST: u8 = 0x22;
const VENDOR_WRITE_REQUEST_TYPE: u8 = 0x40;
const VENDOR_WRITE_REQUEST: u8 = 0x01;
const VENDOR_READ_REQUEST_TYPE: u8 = 0xc0;
const VENDOR_READ_REQUEST: u8 = 0x01;

// SET_CONTROL
const CONTROL_DTR: u8 = 0x01;
const CONTROL_RTS: u8 = 0x02;

// Status byte of the interrupt packet.
const UART_DCD: u8 = 0x01;
const UART_DSR: u8 = 0x02;
const UART_RING: u8 = 0x08;
const UART_CTS: u8 = 0x80;
const STATUS_OFFSET: usize = 8;

/// Lines the chip reports through the interrupt endpoint.
const REPORTED_LINES: ModemLines =
    ModemLines::DCD.union(ModemLines::CTS).union(ModemLines::DSR).union(ModemLines::RI);

/// bMaxPacketSize0 of the HX variant.
const HX_MAX_PACKET_SIZE0: u8 = 64;

const TIMEOUT: Duration = Duration::from_millis(100);
const STATUS_POLL_TIMEOUT: Duration = Duration::from_millis(500);
const STATUS_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Devices handled by this driver.
pub const fn supported_devices() -> &'static [VendorProducts] {
    &[VendorProducts { vendor_id: VENDOR_PROLIFIC, product_ids: &[PRODUCT_PL2303] }]
}

/// Vendor request of the initialization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    Read(u16, u16),
    Write(u16, u16),
}

/// Initialization sequence, taken from the Linux pl2303 driver.
///
/// The final write selecting the chip variant is issued separately.
const INIT_SEQUENCE: [InitStep; 10] = [
    InitStep::Read(0x8484, 0),
    InitStep::Write(0x0404, 0),
    InitStep::Read(0x8484, 0),
    InitStep::Read(0x8383, 0),
    InitStep::Read(0x8484, 0),
    InitStep::Write(0x0404, 1),
    InitStep::Read(0x8484, 0),
    InitStep::Read(0x8383, 0),
    InitStep::Write(0, 1),
    InitStep::Write(1, 0),
];

/// Decodes the status byte of an interrupt packet.
///
/// RTS and DTR are not reported by the chip and never set.
fn decode_status(status: u8) -> ModemStatus {
    let mut current = ModemLines::empty();
    current.set(ModemLines::DCD, status & UART_DCD != 0);
    current.set(ModemLines::CTS, status & UART_CTS != 0);
    current.set(ModemLines::DSR, status & UART_DSR != 0);
    current.set(ModemLines::RI, status & UART_RING != 0);
    ModemStatus::new(REPORTED_LINES, current)
}

/// Encodes a CDC line coding structure.
fn line_coding(baud_rate: u32, data_bits: u8, stop_bits: StopBits, parity: Parity) -> [u8; 7] {
    let [b0, b1, b2, b3] = baud_rate.to_le_bytes();
    let stop_bits = match stop_bits {
        StopBits::One => 0,
        StopBits::Two => 2,
    };
    let parity = match parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
    };
    let data_bits = crate::DataBits::from(data_bits).bits();
    [b0, b1, b2, b3, stop_bits, parity, data_bits]
}

/// Stream of modem status reports.
pub struct ModemStatusStream(Pin<Box<dyn Stream<Item = ModemStatus> + Send + 'static>>);

impl fmt::Debug for ModemStatusStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ModemStatusStream").finish()
    }
}

impl ModemStatusStream {
    fn new(rx: watch::Receiver<ModemStatus>) -> Self {
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let status = *rx.borrow_and_update();
            Some((status, rx))
        });
        Self(Box::pin(stream))
    }
}

impl Stream for ModemStatusStream {
    type Item = ModemStatus;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::into_inner(self).0.poll_next_unpin(cx)
    }
}

struct Port {
    _lock: InterfaceLock,
    claimed: Vec<u8>,
    stop_tx: Option<oneshot::Sender<()>>,
    status_rx: Option<watch::Receiver<ModemStatus>>,
}

/// PL2303 serial port driver.
pub struct Pl2303Driver<T: Transport + 'static> {
    transport: Arc<T>,
    core: UartCore,
    last_status: Arc<StatusCell>,
    control_lines: Mutex<u8>,
    hx: AtomicBool,
    port: Mutex<Option<Port>>,
    status_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> fmt::Debug for Pl2303Driver<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pl2303Driver")
            .field("hx", &self.is_hx())
            .field("control_lines", &self.control_lines())
            .field("last_status", &self.last_status.load())
            .finish()
    }
}

impl<T: Transport + 'static> Pl2303Driver<T> {
    /// Creates a driver for the device behind `transport`.
    ///
    /// The port is initially closed.
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            core: UartCore::default(),
            last_status: Arc::new(StatusCell::default()),
            control_lines: Mutex::new(0),
            hx: AtomicBool::new(false),
            port: Mutex::new(None),
            status_thread: Mutex::new(None),
        }
    }

    /// Sets the initial read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(self, size: usize) -> Self {
        self.core.set_read_buffer_size(size);
        self
    }

    /// Sets the initial write buffer size.
    #[must_use]
    pub fn with_write_buffer_size(self, size: usize) -> Self {
        self.core.set_write_buffer_size(size);
        self
    }

    /// Whether the chip was detected as PL2303HX when it was opened.
    pub fn is_hx(&self) -> bool {
        self.hx.load(Ordering::Relaxed)
    }

    /// Control lines currently asserted by the host.
    pub fn control_lines(&self) -> ModemLines {
        let lines = *self.control_lines.lock().unwrap();
        let mut set = ModemLines::empty();
        set.set(ModemLines::DTR, lines & CONTROL_DTR != 0);
        set.set(ModemLines::RTS, lines & CONTROL_RTS != 0);
        set
    }

    /// Stream of modem status reports pushed by the chip.
    ///
    /// Returns `None` if the port is not open.
    /// The stream ends when the port is closed.
    pub fn status_changes(&self) -> Option<ModemStatusStream> {
        let rx = self.port.lock().unwrap().as_ref()?.status_rx.clone()?;
        Some(ModemStatusStream::new(rx))
    }

    fn vendor_read(&self, value: u16, index: u16) -> Result<u8> {
        let mut buf = [0; 1];
        self.transport.read_control(VENDOR_READ_REQUEST_TYPE, VENDOR_READ_REQUEST, value, index, &mut buf, TIMEOUT)?;
        Ok(buf[0])
    }

    fn vendor_write(&self, value: u16, index: u16) -> Result<()> {
        self.transport.write_control(VENDOR_WRITE_REQUEST_TYPE, VENDOR_WRITE_REQUEST, value, index, &[], TIMEOUT)?;
        Ok(())
    }

    fn set_control_line(&self, line: u8, value: bool) -> Result<()> {
        let mut lines = self.control_lines.lock().unwrap();
        if value {
            *lines |= line;
        } else {
            *lines &= !line;
        }
        self.transport.write_control(SET_CONTROL_REQUEST_TYPE, SET_CONTROL_REQUEST, (*lines).into(), 0, &[], TIMEOUT)?;
        Ok(())
    }

    fn open_port(&self, port: &mut Option<Port>) -> Result<()> {
        let info = self.transport.device_info()?;
        let interfaces = self.transport.interfaces()?;
        let lock = InterfaceLock::acquire(&self.transport, &interfaces)?;
        let claimed = claim_interfaces(&*self.transport, &interfaces);
        let open = port.insert(Port { _lock: lock, claimed, stop_tx: None, status_rx: None });

        let eps = Endpoints::discover(&interfaces)?;
        let Some(status_ep) = eps.interrupt_in else {
            return Err(Error::new(ErrorKind::NotFound, "PL2303 interrupt endpoint not found"));
        };

        let hx = info.max_packet_size0 == HX_MAX_PACKET_SIZE0;
        self.hx.store(hx, Ordering::Relaxed);
        tracing::debug!("PL2303{} detected", if hx { "HX" } else { "" });

        for step in INIT_SEQUENCE {
            match step {
                InitStep::Read(value, index) => {
                    self.vendor_read(value, index)?;
                }
                InitStep::Write(value, index) => self.vendor_write(value, index)?,
            }
        }
        self.vendor_write(2, if hx { 0x44 } else { 0x24 })?;

        // The status thread of a previous connection must not compete for interrupt packets.
        let mut status_thread = self.status_thread.lock().unwrap();
        if let Some(prev) = status_thread.take() {
            tracing::debug!("waiting for previous status thread");
            if prev.join().is_err() {
                tracing::warn!("previous status thread panicked");
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(self.last_status.load());
        let transport = self.transport.clone();
        let last_status = self.last_status.clone();
        *status_thread = Some(
            thread::Builder::new()
                .name(format!("PL2303 {:04x}:{:04x} status", info.vendor_id, info.product_id))
                .spawn(move || monitor_status(transport, status_ep, last_status, status_tx, stop_rx))?,
        );

        open.stop_tx = Some(stop_tx);
        open.status_rx = Some(status_rx);

        Ok(())
    }
}

impl<T: Transport + 'static> UartDriver for Pl2303Driver<T> {
    fn open(&self) -> Result<()> {
        let res = {
            let mut port = self.port.lock().unwrap();
            if port.is_some() {
                return Err(Error::new(ErrorKind::AlreadyExists, "serial port is already open"));
            }
            self.open_port(&mut port)
        };

        match res {
            Ok(()) => {
                tracing::debug!("PL2303 opened");
                Ok(())
            }
            Err(err) => {
                tracing::debug!("opening PL2303 failed: {err}");
                self.close()?;
                Err(err)
            }
        }
    }

    fn close(&self) -> Result<()> {
        let Some(mut port) = self.port.lock().unwrap().take() else { return Ok(()) };

        tracing::debug!("closing PL2303");
        if let Some(stop_tx) = port.stop_tx.take() {
            let _ = stop_tx.send(());

            // Line changes complete the pending interrupt read, so that the status thread
            // observes the stop request without waiting for its poll timeout.
            for (line, value) in [(CONTROL_RTS, true), (CONTROL_DTR, true), (CONTROL_RTS, false), (CONTROL_DTR, false)] {
                if let Err(err) = self.set_control_line(line, value) {
                    tracing::warn!("toggling control lines failed: {err}");
                }
            }
        }

        release_interfaces(&*self.transport, &port.claimed);
        self.transport.close();
        tracing::debug!("PL2303 closed");

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.lock().unwrap().is_some()
    }

    fn read(&self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        Ok(0)
    }

    fn write(&self, _data: &[u8], _timeout: Duration) -> Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        Ok(0)
    }

    fn set_parameters(&self, baud_rate: u32, data_bits: u8, stop_bits: StopBits, parity: Parity) -> Result<()> {
        let coding = line_coding(baud_rate, data_bits, stop_bits, parity);
        self.transport
            .write_control(SET_LINE_REQUEST_TYPE, SET_LINE_REQUEST, 0, 0, &coding, TIMEOUT)
            .map_err(|err| Error::new(err.kind(), format!("error setting line coding: {err}")))?;
        Ok(())
    }

    /// Latest status pushed by the chip; the status thread is the only writer of the cache.
    fn modem_status(&self) -> Result<ModemStatus> {
        Ok(self.last_status.load())
    }

    fn last_modem_status(&self) -> ModemStatus {
        self.last_status.load()
    }

    fn set_rts(&self, value: bool) -> Result<()> {
        self.set_control_line(CONTROL_RTS, value)
    }

    fn set_dtr(&self, value: bool) -> Result<()> {
        self.set_control_line(CONTROL_DTR, value)
    }

    fn read_buffer_size(&self) -> usize {
        self.core.read_buffer_size()
    }

    fn set_read_buffer_size(&self, size: usize) {
        self.core.set_read_buffer_size(size)
    }

    fn write_buffer_size(&self) -> usize {
        self.core.write_buffer_size()
    }

    fn set_write_buffer_size(&self, size: usize) {
        self.core.set_write_buffer_size(size)
    }
}

impl<T: Transport + 'static> Drop for Pl2303Driver<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn monitor_status<T: Transport>(
    transport: Arc<T>, ep: EndpointInfo, last_status: Arc<StatusCell>, status_tx: watch::Sender<ModemStatus>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    tracing::debug!("status thread started");

    let mut buf = vec![0; usize::from(ep.max_packet_size).max(STATUS_OFFSET + 1)];
    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => (),
            _ => break,
        }

        match transport.read_interrupt(ep.address, &mut buf, STATUS_POLL_TIMEOUT) {
            Ok(n) if n > STATUS_OFFSET => {
                let status = decode_status(buf[STATUS_OFFSET]);
                #[cfg(feature = "trace-packets")]
                tracing::trace!("Received modem status {status}");
                last_status.store(status);
                status_tx.send_replace(status);
            }
            Ok(n) => tracing::debug!("ignoring status packet of {n} bytes"),
            Err(err) if err.kind() == ErrorKind::TimedOut => (),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!("device disconnected: {err}");
                break;
            }
            Err(err) => {
                tracing::warn!("reading modem status failed: {err}");
                thread::sleep(STATUS_ERROR_BACKOFF);
            }
        }
    }

    tracing::debug!("status thread terminated");
}
