//! Native transport backed by rusb

use rusb::{DeviceHandle, UsbContext};
use std::{
    io::{Error, ErrorKind, Result},
    time::Duration,
};

use super::{DeviceInfo, Direction, EndpointInfo, InterfaceInfo, TransferType, Transport};

pub(crate) fn to_io_err(error: rusb::Error) -> Error {
    let kind = match error {
        rusb::Error::Io => ErrorKind::ConnectionAborted,
        rusb::Error::InvalidParam => ErrorKind::InvalidInput,
        rusb::Error::Access => ErrorKind::PermissionDenied,
        rusb::Error::NoDevice => ErrorKind::NotFound,
        rusb::Error::NotFound => ErrorKind::NotFound,
        rusb::Error::Busy => ErrorKind::AddrInUse,
        rusb::Error::Timeout => ErrorKind::TimedOut,
        rusb::Error::Overflow => ErrorKind::OutOfMemory,
        rusb::Error::Pipe => ErrorKind::BrokenPipe,
        rusb::Error::Interrupted => ErrorKind::Interrupted,
        rusb::Error::NoMem => ErrorKind::OutOfMemory,
        rusb::Error::NotSupported => ErrorKind::Unsupported,
        rusb::Error::BadDescriptor => ErrorKind::InvalidInput,
        rusb::Error::Other => ErrorKind::Other,
    };

    Error::new(kind, error)
}

impl<C: UsbContext> Transport for DeviceHandle<C> {
    fn device_info(&self) -> Result<DeviceInfo> {
        let desc = self.device().device_descriptor().map_err(to_io_err)?;
        Ok(DeviceInfo {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            max_packet_size0: desc.max_packet_size(),
        })
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let cfg = self.device().active_config_descriptor().map_err(to_io_err)?;

        let mut interfaces = Vec::new();
        for iface in cfg.interfaces() {
            let Some(desc) = iface.descriptors().find(|desc| desc.setting_number() == 0) else { continue };
            let endpoints = desc
                .endpoint_descriptors()
                .map(|ep| EndpointInfo {
                    address: ep.address(),
                    direction: match ep.direction() {
                        rusb::Direction::In => Direction::In,
                        rusb::Direction::Out => Direction::Out,
                    },
                    transfer_type: match ep.transfer_type() {
                        rusb::TransferType::Control => TransferType::Control,
                        rusb::TransferType::Isochronous => TransferType::Isochronous,
                        rusb::TransferType::Bulk => TransferType::Bulk,
                        rusb::TransferType::Interrupt => TransferType::Interrupt,
                    },
                    max_packet_size: ep.max_packet_size(),
                })
                .collect();
            interfaces.push(InterfaceInfo { number: iface.number(), endpoints });
        }
        interfaces.sort_by_key(|iface| iface.number);

        Ok(interfaces)
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        DeviceHandle::claim_interface(self, interface).map_err(to_io_err)
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        DeviceHandle::release_interface(self, interface).map_err(to_io_err)
    }

    fn read_control(
        &self, request_type: u8, request: u8, value: u16, index: u16, buf: &mut [u8], timeout: Duration,
    ) -> Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout).map_err(to_io_err)
    }

    fn write_control(
        &self, request_type: u8, request: u8, value: u16, index: u16, buf: &[u8], timeout: Duration,
    ) -> Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout).map_err(to_io_err)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout).map_err(to_io_err)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout).map_err(to_io_err)
    }

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        DeviceHandle::read_interrupt(self, endpoint, buf, timeout).map_err(to_io_err)
    }
}
