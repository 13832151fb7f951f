//! Supported devices and driver selection.

use std::{collections::HashMap, fmt, io::Result, sync::Arc, sync::LazyLock};

use crate::{cp210x::Cp210xDriver, pl2303::Pl2303Driver, transport::Transport, UartDriver};

/// Silicon Laboratories vendor id.
pub const VENDOR_SILABS: u16 = 0x10c4;
/// CP2102 product id.
pub const PRODUCT_CP2102: u16 = 0xea60;

/// Prolific vendor id.
pub const VENDOR_PROLIFIC: u16 = 0x067b;
/// PL2303 product id.
pub const PRODUCT_PL2303: u16 = 0x2303;

/// Products of one vendor handled by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VendorProducts {
    /// Vendor id.
    pub vendor_id: u16,
    /// Product ids, in lookup order.
    pub product_ids: &'static [u16],
}

/// Chip driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Silicon Labs CP210x.
    Cp210x,
    /// Prolific PL2303.
    Pl2303,
}

impl DriverKind {
    /// All driver families, in matching order.
    pub const ALL: [DriverKind; 2] = [DriverKind::Cp210x, DriverKind::Pl2303];

    /// Devices handled by the driver family.
    pub fn supported_devices(self) -> &'static [VendorProducts] {
        match self {
            Self::Cp210x => crate::cp210x::supported_devices(),
            Self::Pl2303 => crate::pl2303::supported_devices(),
        }
    }

    /// Name of the driver family.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cp210x => "CP210x",
            Self::Pl2303 => "PL2303",
        }
    }

    /// Creates a closed driver of this family for the device behind `transport`.
    pub fn driver<T: Transport + 'static>(self, transport: Arc<T>) -> Box<dyn UartDriver> {
        match self {
            Self::Cp210x => Box::new(Cp210xDriver::new(transport)),
            Self::Pl2303 => Box::new(Pl2303Driver::new(transport)),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

static DEVICES: LazyLock<HashMap<(u16, u16), DriverKind>> = LazyLock::new(|| {
    let mut devices = HashMap::new();
    for kind in DriverKind::ALL {
        for entry in kind.supported_devices() {
            for &product_id in entry.product_ids {
                devices.entry((entry.vendor_id, product_id)).or_insert(kind);
            }
        }
    }
    devices
});

/// Finds the driver family that handles the device with the specified vendor and product id.
pub fn lookup(vendor_id: u16, product_id: u16) -> Option<DriverKind> {
    DEVICES.get(&(vendor_id, product_id)).copied()
}

/// Creates a driver for the device behind `transport` by matching its device descriptor.
///
/// Returns `None` if no driver handles the device.
/// The returned driver is closed.
pub fn probe<T: Transport + 'static>(transport: Arc<T>) -> Result<Option<Box<dyn UartDriver>>> {
    let info = transport.device_info()?;
    let Some(kind) = lookup(info.vendor_id, info.product_id) else {
        tracing::debug!("no driver for device {:04x}:{:04x}", info.vendor_id, info.product_id);
        return Ok(None);
    };

    tracing::debug!("using {kind} driver for device {:04x}:{:04x}", info.vendor_id, info.product_id);
    Ok(Some(kind.driver(transport)))
}
