//! Silicon Labs CP210x driver.
//!
//! Register interface as described in Silicon Labs application note AN571.

use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    driver::{
        claim_interfaces, not_open, release_interfaces, Endpoints, InterfaceLock, StatusCell, UartCore, UartDriver,
    },
    registry::{VendorProducts, PRODUCT_CP2102, VENDOR_SILABS},
    transport::Transport,
    DataBits, LineConfig, ModemLines, ModemStatus, Parity, StopBits,
};

/// Vendor request, host to device, recipient interface.
const REQTYPE_HOST_TO_DEVICE: u8 = 0x41;
/// Vendor request, device to host, recipient interface.
const REQTYPE_DEVICE_TO_HOST: u8 = 0xc1;

const IFC_ENABLE: u8 = 0x00;
const SET_BAUDDIV: u8 = 0x01;
const SET_LINE_CTL: u8 = 0x03;
const SET_MHS: u8 = 0x07;
const GET_MDMSTS: u8 = 0x08;
const SET_BAUDRATE: u8 = 0x1e;

const UART_ENABLE: u16 = 0x0001;
const UART_DISABLE: u16 = 0x0000;

const BAUD_RATE_GEN_FREQ: u32 = 0x38_4000;

// SET_MHS
const MCR_DTR: u16 = 0x0001;
const MCR_RTS: u16 = 0x0002;
const MCR_ALL: u16 = MCR_DTR | MCR_RTS;
const CONTROL_WRITE_DTR: u16 = 0x0100;
const CONTROL_WRITE_RTS: u16 = 0x0200;

// GET_MDMSTS
const STATUS_DTR: u8 = 0x01;
const STATUS_RTS: u8 = 0x02;
const STATUS_CTS: u8 = 0x10;
const STATUS_DSR: u8 = 0x20;
const STATUS_RI: u8 = 0x40;
const STATUS_DCD: u8 = 0x80;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Devices handled by this driver.
pub const fn supported_devices() -> &'static [VendorProducts] {
    &[VendorProducts { vendor_id: VENDOR_SILABS, product_ids: &[PRODUCT_CP2102] }]
}

/// Line control value selecting the number of data bits.
fn data_bits_value(data_bits: DataBits) -> u16 {
    match data_bits {
        DataBits::Five => 0x0500,
        DataBits::Six => 0x0600,
        DataBits::Seven => 0x0700,
        DataBits::Eight => 0x0800,
    }
}

/// Line control value selecting the parity.
fn parity_value(parity: Parity) -> u16 {
    match parity {
        Parity::None => 0x0000,
        Parity::Odd => 0x0010,
        Parity::Even => 0x0020,
    }
}

/// Line control value selecting the number of stop bits.
fn stop_bits_value(stop_bits: StopBits) -> u16 {
    match stop_bits {
        StopBits::One => 0x0000,
        StopBits::Two => 0x0002,
    }
}

/// Decodes the GET_MDMSTS status byte.
///
/// The chip reports only absolute line states, thus every signal is flagged as changed.
fn decode_status(status: u8) -> ModemStatus {
    let mut current = ModemLines::empty();
    for (bit, line) in [
        (STATUS_DCD, ModemLines::DCD),
        (STATUS_CTS, ModemLines::CTS),
        (STATUS_RTS, ModemLines::RTS),
        (STATUS_DSR, ModemLines::DSR),
        (STATUS_DTR, ModemLines::DTR),
        (STATUS_RI, ModemLines::RI),
    ] {
        current.set(line, status & bit != 0);
    }
    ModemStatus::new(ModemLines::all(), current)
}

struct Port {
    _lock: InterfaceLock,
    claimed: Vec<u8>,
    eps: Endpoints,
}

/// CP210x serial port driver.
pub struct Cp210xDriver<T: Transport> {
    transport: Arc<T>,
    core: UartCore,
    last_status: StatusCell,
    port: Mutex<Option<Port>>,
}

impl<T: Transport> fmt::Debug for Cp210xDriver<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cp210xDriver").field("last_status", &self.last_status.load()).finish()
    }
}

impl<T: Transport> Cp210xDriver<T> {
    /// Creates a driver for the device behind `transport`.
    ///
    /// The port is initially closed.
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport, core: UartCore::default(), last_status: StatusCell::default(), port: Mutex::new(None) }
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

    fn set_config(&self, request: u8, value: u16) -> Result<usize> {
        self.transport.write_control(REQTYPE_HOST_TO_DEVICE, request, value, 0, &[], TIMEOUT)
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.transport
            .write_control(REQTYPE_HOST_TO_DEVICE, SET_BAUDRATE, 0, 0, &baud_rate.to_le_bytes(), TIMEOUT)
            .map_err(|err| Error::new(err.kind(), format!("error setting baud rate: {err}")))?;
        Ok(())
    }

    fn open_port(&self, port: &mut Option<Port>) -> Result<()> {
        let interfaces = self.transport.interfaces()?;
        let lock = InterfaceLock::acquire(&self.transport, &interfaces)?;
        let claimed = claim_interfaces(&*self.transport, &interfaces);
        let open = port.insert(Port { _lock: lock, claimed, eps: Endpoints::default() });

        open.eps = Endpoints::discover(&interfaces)?;
        if open.eps.bulk_in.is_none() || open.eps.bulk_out.is_none() {
            return Err(Error::new(ErrorKind::NotFound, "CP210x bulk endpoints not found"));
        }

        self.set_config(IFC_ENABLE, UART_ENABLE)?;
        self.set_config(SET_MHS, MCR_ALL | CONTROL_WRITE_DTR | CONTROL_WRITE_RTS)?;
        let div = BAUD_RATE_GEN_FREQ / LineConfig::DEFAULT_BAUD_RATE;
        self.set_config(SET_BAUDDIV, div as u16)?;

        Ok(())
    }

    fn endpoints(&self) -> Result<Endpoints> {
        self.port.lock().unwrap().as_ref().map(|port| port.eps).ok_or_else(not_open)
    }
}

impl<T: Transport> UartDriver for Cp210xDriver<T> {
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
                tracing::debug!("CP210x opened");
                Ok(())
            }
            Err(err) => {
                tracing::debug!("opening CP210x failed: {err}");
                self.close()?;
                Err(err)
            }
        }
    }

    fn close(&self) -> Result<()> {
        let Some(port) = self.port.lock().unwrap().take() else { return Ok(()) };

        tracing::debug!("closing CP210x");
        if let Err(err) = self.set_config(IFC_ENABLE, UART_DISABLE) {
            tracing::warn!("disabling UART failed: {err}");
        }
        release_interfaces(&*self.transport, &port.claimed);
        self.transport.close();

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.lock().unwrap().is_some()
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let ep = self.endpoints()?.bulk_in.ok_or_else(not_open)?;
        self.core.read_bulk(&*self.transport, ep.address, buf, timeout)
    }

    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let ep = self.endpoints()?.bulk_out.ok_or_else(not_open)?;
        self.core.write_bulk(&*self.transport, ep.address, data, timeout)
    }

    fn set_parameters(&self, baud_rate: u32, data_bits: u8, stop_bits: StopBits, parity: Parity) -> Result<()> {
        self.set_baud_rate(baud_rate)?;

        // One SET_LINE_CTL request per field.
        self.set_config(SET_LINE_CTL, data_bits_value(data_bits.into()))?;
        self.set_config(SET_LINE_CTL, parity_value(parity))?;
        self.set_config(SET_LINE_CTL, stop_bits_value(stop_bits))?;

        Ok(())
    }

    fn modem_status(&self) -> Result<ModemStatus> {
        let mut buf = [0; 1];
        let n = self.transport.read_control(REQTYPE_DEVICE_TO_HOST, GET_MDMSTS, 0, 0, &mut buf, TIMEOUT)?;
        if n != buf.len() {
            return Err(Error::new(ErrorKind::UnexpectedEof, "no modem status received"));
        }

        let status = decode_status(buf[0]);
        self.last_status.store(status);
        Ok(status)
    }

    fn last_modem_status(&self) -> ModemStatus {
        self.last_status.load()
    }

    // Ignored by the chip while its handshaking logic controls the lines.
    fn set_rts(&self, value: bool) -> Result<()> {
        self.set_config(SET_MHS, CONTROL_WRITE_RTS | if value { MCR_RTS } else { 0 })?;
        Ok(())
    }

    fn set_dtr(&self, value: bool) -> Result<()> {
        self.set_config(SET_MHS, CONTROL_WRITE_DTR | if value { MCR_DTR } else { 0 })?;
        Ok(())
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

impl<T: Transport> Drop for Cp210xDriver<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
