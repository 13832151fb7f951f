//! USB UART bridge drivers
//!
//! Drives USB-to-serial bridge chips through one uniform serial port contract, the [`UartDriver`] trait.
//! Supported chip families are Silicon Labs [CP210x](cp210x) and Prolific [PL2303](pl2303).
//!
//! The USB stack itself is supplied by the caller through the [`Transport`] trait.
//! With crate feature `host` it is implemented for [`rusb::DeviceHandle`].
//!
//! Use [`registry::probe`] to pick the driver that claims a device.
//!

use bitflags::bitflags;
use std::fmt;

pub mod cp210x;
pub mod driver;
pub mod pl2303;
pub mod registry;
pub mod transport;

pub use driver::UartDriver;
pub use transport::Transport;

/// Default size of the internal read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Default size of the internal write buffer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

bitflags! {
    /// Set of modem handshake signals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModemLines: u8 {
        /// Data carrier detect.
        const DCD = 0x01;
        /// Clear to send.
        const CTS = 0x02;
        /// Data set ready.
        const DSR = 0x04;
        /// Data terminal ready (driven by the host).
        const DTR = 0x08;
        /// Request to send (driven by the host).
        const RTS = 0x10;
        /// Ring indicator.
        const RI = 0x20;
    }
}

/// Modem status word.
///
/// `current` holds the state of each signal, `changed` the signals that changed since the last report.
/// A signal the chip cannot report is never set in either mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModemStatus {
    /// Signals that changed.
    pub changed: ModemLines,
    /// Signals that are currently active.
    pub current: ModemLines,
}

impl ModemStatus {
    /// Creates a new status word.
    pub const fn new(changed: ModemLines, current: ModemLines) -> Self {
        Self { changed, current }
    }

    /// Packs the status into a word: current state in the low byte, changed mask in the high byte.
    pub const fn to_word(self) -> u16 {
        ((self.changed.bits() as u16) << 8) | self.current.bits() as u16
    }

    /// Unpacks a status word.
    ///
    /// Bits that do not correspond to a signal are dropped.
    pub const fn from_word(word: u16) -> Self {
        Self {
            changed: ModemLines::from_bits_truncate((word >> 8) as u8),
            current: ModemLines::from_bits_truncate(word as u8),
        }
    }

    /// Whether `line` is currently active.
    pub fn is_set(&self, line: ModemLines) -> bool {
        self.current.contains(line)
    }
}

impl fmt::Display for ModemStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(ModemLines, &str, &str); 6] = [
            (ModemLines::DCD, "DCD", "dcd"),
            (ModemLines::CTS, "CTS", "cts"),
            (ModemLines::RTS, "RTS", "rts"),
            (ModemLines::DSR, "DSR", "dsr"),
            (ModemLines::DTR, "DTR", "dtr"),
            (ModemLines::RI, "RI", "ri"),
        ];

        let mut first = true;
        for (line, on, off) in NAMES {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}", if self.current.contains(line) { on } else { off })?;
        }
        Ok(())
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl DataBits {
    /// Number of bits.
    pub const fn bits(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl From<u8> for DataBits {
    /// Unsupported bit counts fall back to 8 data bits.
    fn from(bits: u8) -> Self {
        match bits {
            5 => Self::Five,
            6 => Self::Six,
            7 => Self::Seven,
            _ => Self::Eight,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Parity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Serial line configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineConfig {
    /// Baud rate in bits per second.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Parity.
    pub parity: Parity,
}

impl LineConfig {
    /// Default baud rate.
    pub const DEFAULT_BAUD_RATE: u32 = 9600;

    /// Creates an 8N1 configuration with the specified baud rate.
    pub const fn new(baud_rate: u32) -> Self {
        Self { baud_rate, data_bits: DataBits::Eight, stop_bits: StopBits::One, parity: Parity::None }
    }

    /// Sets the data bits.
    #[must_use]
    pub const fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Sets the stop bits.
    #[must_use]
    pub const fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Sets the parity.
    #[must_use]
    pub const fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
}

impl Default for LineConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BAUD_RATE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_word_layout() {
        let status = ModemStatus::new(ModemLines::all(), ModemLines::DCD | ModemLines::DTR);
        assert_eq!(status.to_word(), 0x3f09);
        assert_eq!(ModemStatus::from_word(0x3f09), status);
    }

    #[test]
    fn status_word_drops_unknown_bits() {
        let status = ModemStatus::from_word(0xc0c0 | 0x0102);
        assert_eq!(status.changed, ModemLines::DCD);
        assert_eq!(status.current, ModemLines::CTS);
    }

    #[test]
    fn status_display() {
        let status = ModemStatus::new(ModemLines::empty(), ModemLines::CTS | ModemLines::RI);
        assert_eq!(status.to_string(), "dcd CTS rts dsr dtr RI");
    }

    #[test]
    fn data_bits_fallback() {
        assert_eq!(DataBits::from(5), DataBits::Five);
        assert_eq!(DataBits::from(7), DataBits::Seven);
        assert_eq!(DataBits::from(9), DataBits::Eight);
        assert_eq!(DataBits::from(0), DataBits::Eight);
    }

    #[test]
    fn default_line_config() {
        let config = LineConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits.bits(), 8);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
    }
}
