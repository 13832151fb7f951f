//! Serial port contract shared by all chip drivers.

use bytes::BytesMut;
use std::{
    collections::HashSet,
    io::{Error, ErrorKind, Result},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, LazyLock, Mutex,
    },
    time::Duration,
};

use crate::{
    transport::{Direction, EndpointInfo, InterfaceInfo, TransferType, Transport},
    LineConfig, ModemLines, ModemStatus, Parity, StopBits, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE,
};

/// USB serial port driver.
///
/// A driver is bound to one device.
/// It starts out closed and must be [opened](Self::open) before use.
///
/// All methods take `&self`; a read and a write may run concurrently from different threads.
pub trait UartDriver: Send + Sync {
    /// Opens the serial port.
    ///
    /// If opening fails, the port is closed again before the error is returned.
    fn open(&self) -> Result<()>;

    /// Closes the serial port.
    ///
    /// Closing a port that is not open does nothing.
    fn close(&self) -> Result<()>;

    /// Whether the port is open.
    fn is_open(&self) -> bool;

    /// Reads at most `buf.len()` bytes into `buf`.
    ///
    /// Returns `0` if no data arrived within `timeout`.
    /// Fails with [`ErrorKind::NotConnected`] if the port is not open.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Writes all of `data`.
    ///
    /// Data is sent in chunks of at most the write buffer size.
    /// If a chunk fails, an error is returned and the number of bytes already sent is not reported.
    /// Fails with [`ErrorKind::NotConnected`] if the port is not open.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Sets the line parameters.
    ///
    /// Data bits other than 5, 6, 7 or 8 fall back to 8.
    fn set_parameters(&self, baud_rate: u32, data_bits: u8, stop_bits: StopBits, parity: Parity) -> Result<()>;

    /// Sets the line parameters from a [`LineConfig`].
    fn set_line_config(&self, config: &LineConfig) -> Result<()> {
        self.set_parameters(config.baud_rate, config.data_bits.bits(), config.stop_bits, config.parity)
    }

    /// Queries the modem status.
    ///
    /// The result is also stored as the [last modem status](Self::last_modem_status).
    fn modem_status(&self) -> Result<ModemStatus>;

    /// Modem status observed by the most recent query.
    fn last_modem_status(&self) -> ModemStatus;

    /// Sets the RTS line.
    fn set_rts(&self, value: bool) -> Result<()>;

    /// Sets the DTR line.
    fn set_dtr(&self, value: bool) -> Result<()>;

    /// Size of the internal read buffer.
    fn read_buffer_size(&self) -> usize;

    /// Resizes the internal read buffer.
    ///
    /// Buffered data is discarded unless the size is unchanged.
    fn set_read_buffer_size(&self, size: usize);

    /// Size of the internal write buffer.
    fn write_buffer_size(&self) -> usize;

    /// Resizes the internal write buffer.
    ///
    /// Buffered data is discarded unless the size is unchanged.
    fn set_write_buffer_size(&self, size: usize);

    /// Queries the DCD (carrier detect) line.
    fn cd(&self) -> Result<bool> {
        Ok(self.modem_status()?.is_set(ModemLines::DCD))
    }

    /// Queries the CTS line.
    fn cts(&self) -> Result<bool> {
        Ok(self.modem_status()?.is_set(ModemLines::CTS))
    }

    /// Queries the RTS line.
    fn rts(&self) -> Result<bool> {
        Ok(self.modem_status()?.is_set(ModemLines::RTS))
    }

    /// Queries the DSR line.
    fn dsr(&self) -> Result<bool> {
        Ok(self.modem_status()?.is_set(ModemLines::DSR))
    }

    /// Queries the DTR line.
    fn dtr(&self) -> Result<bool> {
        Ok(self.modem_status()?.is_set(ModemLines::DTR))
    }

    /// Queries the RI (ring indicator) line.
    fn ri(&self) -> Result<bool> {
        Ok(self.modem_status()?.is_set(ModemLines::RI))
    }

    /// DCD line from the last modem status.
    fn last_cd(&self) -> bool {
        self.last_modem_status().is_set(ModemLines::DCD)
    }

    /// CTS line from the last modem status.
    fn last_cts(&self) -> bool {
        self.last_modem_status().is_set(ModemLines::CTS)
    }

    /// RTS line from the last modem status.
    fn last_rts(&self) -> bool {
        self.last_modem_status().is_set(ModemLines::RTS)
    }

    /// DSR line from the last modem status.
    fn last_dsr(&self) -> bool {
        self.last_modem_status().is_set(ModemLines::DSR)
    }

    /// DTR line from the last modem status.
    fn last_dtr(&self) -> bool {
        self.last_modem_status().is_set(ModemLines::DTR)
    }

    /// RI line from the last modem status.
    fn last_ri(&self) -> bool {
        self.last_modem_status().is_set(ModemLines::RI)
    }
}

/// Modem status shared between a status source and its readers.
#[derive(Debug, Default)]
pub(crate) struct StatusCell(AtomicU16);

impl StatusCell {
    pub fn load(&self) -> ModemStatus {
        ModemStatus::from_word(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: ModemStatus) {
        self.0.store(status.to_word(), Ordering::Release);
    }
}

/// Buffering shared by the chip drivers.
#[derive(Debug)]
pub(crate) struct UartCore {
    read_buf: Mutex<BytesMut>,
    write_buf: Mutex<BytesMut>,
}

impl UartCore {
    pub fn new(read_size: usize, write_size: usize) -> Self {
        Self { read_buf: Mutex::new(BytesMut::zeroed(read_size)), write_buf: Mutex::new(BytesMut::zeroed(write_size)) }
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buf.lock().unwrap().len()
    }

    pub fn set_read_buffer_size(&self, size: usize) {
        resize(&mut self.read_buf.lock().unwrap(), size);
    }

    pub fn write_buffer_size(&self) -> usize {
        self.write_buf.lock().unwrap().len()
    }

    pub fn set_write_buffer_size(&self, size: usize) {
        resize(&mut self.write_buf.lock().unwrap(), size);
    }

    /// Reads from a bulk endpoint through the read buffer.
    ///
    /// A timeout yields zero bytes.
    pub fn read_bulk<T: Transport + ?Sized>(
        &self, transport: &T, ep: u8, dest: &mut [u8], timeout: Duration,
    ) -> Result<usize> {
        let mut buf = self.read_buf.lock().unwrap();
        let len = dest.len().min(buf.len());

        let n = match transport.read_bulk(ep, &mut buf[..len], timeout) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::TimedOut => return Ok(0),
            Err(err) => return Err(err),
        };

        #[cfg(feature = "trace-packets")]
        tracing::trace!("Received {n} bytes");
        dest[..n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Writes to a bulk endpoint in chunks of at most the write buffer size.
    ///
    /// The first chunk is sent directly from `src`, later chunks are staged in the write buffer.
    pub fn write_bulk<T: Transport + ?Sized>(
        &self, transport: &T, ep: u8, src: &[u8], timeout: Duration,
    ) -> Result<usize> {
        let mut offset = 0;

        while offset < src.len() {
            let (len, res) = {
                let mut buf = self.write_buf.lock().unwrap();
                let len = (src.len() - offset).min(buf.len());
                if len == 0 {
                    return Err(Error::new(ErrorKind::InvalidInput, "write buffer has zero size"));
                }

                let res = if offset == 0 {
                    transport.write_bulk(ep, &src[..len], timeout)
                } else {
                    buf[..len].copy_from_slice(&src[offset..offset + len]);
                    transport.write_bulk(ep, &buf[..len], timeout)
                };
                (len, res)
            };

            let n = match res {
                Ok(n) if n > 0 => n,
                Ok(_) => return Err(write_err(ErrorKind::WriteZero, len, offset, src.len(), None)),
                Err(err) => return Err(write_err(err.kind(), len, offset, src.len(), Some(err))),
            };

            #[cfg(feature = "trace-packets")]
            tracing::trace!("Wrote {n} of {len} bytes at offset {offset}");
            offset += n;
        }

        Ok(offset)
    }
}

fn resize(buf: &mut BytesMut, size: usize) {
    if buf.len() == size {
        return;
    }
    *buf = BytesMut::zeroed(size);
}

fn write_err(kind: ErrorKind, len: usize, offset: usize, total: usize, source: Option<Error>) -> Error {
    let msg = format!("error writing {len} bytes at offset {offset} length={total}");
    match source {
        Some(err) => Error::new(kind, format!("{msg}: {err}")),
        None => Error::new(kind, msg),
    }
}

impl Default for UartCore {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE)
    }
}

/// Endpoints found on the data interface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub bulk_in: Option<EndpointInfo>,
    pub bulk_out: Option<EndpointInfo>,
    pub interrupt_in: Option<EndpointInfo>,
}

impl Endpoints {
    /// Collects the endpoints of the highest-numbered interface.
    pub fn discover(interfaces: &[InterfaceInfo]) -> Result<Self> {
        let iface = interfaces
            .iter()
            .max_by_key(|iface| iface.number)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "USB device has no interfaces"))?;

        let mut eps = Self::default();
        for ep in &iface.endpoints {
            match (ep.transfer_type, ep.direction) {
                (TransferType::Bulk, Direction::In) => eps.bulk_in = Some(*ep),
                (TransferType::Bulk, Direction::Out) => eps.bulk_out = Some(*ep),
                (TransferType::Interrupt, Direction::In) => eps.interrupt_in = Some(*ep),
                _ => (),
            }
        }
        tracing::debug!("interface {} endpoints: {eps:?}", iface.number);

        Ok(eps)
    }
}

/// Claims all interfaces, skipping those that cannot be claimed.
///
/// Returns the claimed interface numbers.
pub(crate) fn claim_interfaces<T: Transport + ?Sized>(transport: &T, interfaces: &[InterfaceInfo]) -> Vec<u8> {
    let mut claimed = Vec::new();
    for iface in interfaces {
        match transport.claim_interface(iface.number) {
            Ok(()) => {
                tracing::debug!("claimed interface {}", iface.number);
                claimed.push(iface.number);
            }
            Err(err) => tracing::warn!("claiming interface {} failed: {err}", iface.number),
        }
    }
    claimed
}

/// Releases previously claimed interfaces.
pub(crate) fn release_interfaces<T: Transport + ?Sized>(transport: &T, claimed: &[u8]) {
    for &iface in claimed {
        if let Err(err) = transport.release_interface(iface) {
            tracing::warn!("releasing interface {iface} failed: {err}");
        }
    }
}

pub(crate) fn not_open() -> Error {
    Error::new(ErrorKind::NotConnected, "serial port is not open")
}

/// Interfaces owned by open serial ports, as pairs of transport address and interface number.
static OWNED_INTERFACES: LazyLock<Mutex<HashSet<(usize, u8)>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Exclusive ownership of device interfaces by one open serial port.
///
/// Two drivers sharing a transport cannot both open a port on the same interface.
/// Ownership ends when the lock is dropped.
#[derive(Debug)]
pub(crate) struct InterfaceLock {
    transport: usize,
    interfaces: Vec<u8>,
}

impl InterfaceLock {
    /// Takes ownership of `interfaces` of the device behind `transport`.
    ///
    /// Fails with [`ErrorKind::ResourceBusy`] if any of them is owned by another open port.
    pub fn acquire<T: ?Sized>(transport: &Arc<T>, interfaces: &[InterfaceInfo]) -> Result<Self> {
        let transport = Arc::as_ptr(transport) as *const () as usize;
        let mut owned = OWNED_INTERFACES.lock().unwrap();

        if let Some(iface) = interfaces.iter().find(|iface| owned.contains(&(transport, iface.number))) {
            return Err(Error::new(
                ErrorKind::ResourceBusy,
                format!("interface {} is owned by another open serial port", iface.number),
            ));
        }

        let interfaces: Vec<u8> = interfaces.iter().map(|iface| iface.number).collect();
        owned.extend(interfaces.iter().map(|&number| (transport, number)));

        Ok(Self { transport, interfaces })
    }
}

impl Drop for InterfaceLock {
    fn drop(&mut self) {
        let mut owned = OWNED_INTERFACES.lock().unwrap();
        for &number in &self.interfaces {
            owned.remove(&(self.transport, number));
        }
    }
}
