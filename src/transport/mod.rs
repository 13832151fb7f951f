//! USB transport used by the drivers.
//!
//! The drivers never talk to a USB stack directly. They issue control, bulk and interrupt transfers
//! through the [`Transport`] trait, which is implemented by the host USB stack.
//!
//! ### Native platforms (crate feature `host`)
//!
//! [`Transport`] is implemented for [`rusb::DeviceHandle`].
//! Some errors returned from it have an inner error type of [`rusb::Error`].
//!

use std::{io::Result, time::Duration};

#[cfg(feature = "host")]
mod native;
#[cfg(feature = "host")]
pub use native::*;

/// Endpoint direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// Control endpoint.
    Control,
    /// Isochronous endpoint.
    Isochronous,
    /// Bulk endpoint.
    Bulk,
    /// Interrupt endpoint.
    Interrupt,
}

/// Endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit.
    pub address: u8,
    /// Direction.
    pub direction: Direction,
    /// Transfer type.
    pub transfer_type: TransferType,
    /// Maximum packet size.
    pub max_packet_size: u16,
}

/// Interface descriptor of the default alternate setting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceInfo {
    /// Interface number.
    pub number: u8,
    /// Endpoints of the interface.
    pub endpoints: Vec<EndpointInfo>,
}

/// Device descriptor fields used by the drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    /// Vendor id.
    pub vendor_id: u16,
    /// Product id.
    pub product_id: u16,
    /// Maximum packet size of endpoint zero.
    pub max_packet_size0: u8,
}

/// Connection to a USB device.
///
/// Transfer methods return the number of bytes transferred.
/// A transfer that does not complete within `timeout` fails with [`ErrorKind::TimedOut`](std::io::ErrorKind::TimedOut).
pub trait Transport: Send + Sync {
    /// Device descriptor.
    fn device_info(&self) -> Result<DeviceInfo>;

    /// Interfaces of the active configuration, ordered by interface number.
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    /// Claims an interface.
    fn claim_interface(&self, interface: u8) -> Result<()>;

    /// Releases a claimed interface.
    fn release_interface(&self, interface: u8) -> Result<()>;

    /// Performs a device-to-host control transfer.
    fn read_control(
        &self, request_type: u8, request: u8, value: u16, index: u16, buf: &mut [u8], timeout: Duration,
    ) -> Result<usize>;

    /// Performs a host-to-device control transfer.
    fn write_control(
        &self, request_type: u8, request: u8, value: u16, index: u16, buf: &[u8], timeout: Duration,
    ) -> Result<usize>;

    /// Reads from a bulk endpoint.
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Writes to a bulk endpoint.
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Reads from an interrupt endpoint.
    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Closes the connection.
    ///
    /// Transfers issued afterwards may fail.
    fn close(&self) {}
}
