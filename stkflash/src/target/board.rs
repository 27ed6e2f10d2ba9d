//! Board profiles.
//!
//! A board profile names everything the programmer needs to know about a
//! target: the serial speed of its bootloader, the expected device signature,
//! the flash page size and the `Set Device` parameter block.

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::stk500::{DEVICE_PARAMETER_COUNT, SIGNATURE_LEN};

/// Default response timeout for a board.
pub const DEFAULT_TIMEOUT_MS: u64 = 400;

#[cfg(feature = "serde")]
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// The 20 parameter bytes of `Cmnd_STK_SET_DEVICE`, in wire order.
///
/// Unspecified fields are 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[allow(missing_docs)]
pub struct DeviceParameters {
    pub devicecode: u8,
    pub revision: u8,
    pub progtype: u8,
    pub parmode: u8,
    pub polling: u8,
    pub selftimed: u8,
    pub lockbytes: u8,
    pub fusebytes: u8,
    pub flashpollval1: u8,
    pub flashpollval2: u8,
    pub eeprompollval1: u8,
    pub eeprompollval2: u8,
    pub pagesizehigh: u8,
    pub pagesizelow: u8,
    pub eepromsizehigh: u8,
    pub eepromsizelow: u8,
    pub flashsize4: u8,
    pub flashsize3: u8,
    pub flashsize2: u8,
    pub flashsize1: u8,
}

impl DeviceParameters {
    /// Parameters for a classic megaAVR with the given memory geometry.
    pub fn mega(page_size: u16, eeprom_size: u16, flash_size: u32) -> Self {
        let [pagesizehigh, pagesizelow] = page_size.to_be_bytes();
        let [eepromsizehigh, eepromsizelow] = eeprom_size.to_be_bytes();
        let [flashsize4, flashsize3, flashsize2, flashsize1] = flash_size.to_be_bytes();

        Self {
            devicecode: 0x86,
            parmode: 1,
            polling: 1,
            selftimed: 1,
            lockbytes: 1,
            fusebytes: 3,
            flashpollval1: 0xFF,
            flashpollval2: 0xFF,
            eeprompollval1: 0xFF,
            eeprompollval2: 0xFF,
            pagesizehigh,
            pagesizelow,
            eepromsizehigh,
            eepromsizelow,
            flashsize4,
            flashsize3,
            flashsize2,
            flashsize1,
            ..Self::default()
        }
    }

    /// Flash size in bytes, or `None` if unspecified.
    pub fn flash_size(&self) -> Option<usize> {
        let size = u32::from_be_bytes([
            self.flashsize4,
            self.flashsize3,
            self.flashsize2,
            self.flashsize1,
        ]);
        usize::try_from(size).ok().filter(|&size| size > 0)
    }

    /// The parameter block in wire order.
    pub fn to_bytes(&self) -> [u8; DEVICE_PARAMETER_COUNT] {
        [
            self.devicecode,
            self.revision,
            self.progtype,
            self.parmode,
            self.polling,
            self.selftimed,
            self.lockbytes,
            self.fusebytes,
            self.flashpollval1,
            self.flashpollval2,
            self.eeprompollval1,
            self.eeprompollval2,
            self.pagesizehigh,
            self.pagesizelow,
            self.eepromsizehigh,
            self.eepromsizelow,
            self.flashsize4,
            self.flashsize3,
            self.flashsize2,
            self.flashsize1,
        ]
    }
}

/// Everything the programmer needs to know about a board.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoardProfile {
    /// Board name used for lookup.
    pub name: String,
    /// Bootloader baud rate.
    pub baud_rate: u32,
    /// Expected device signature.
    pub signature: [u8; SIGNATURE_LEN],
    /// Flash page size in bytes.
    pub page_size: u16,
    /// Response timeout in milliseconds.
    #[cfg_attr(feature = "serde", serde(default = "default_timeout_ms"))]
    pub timeout_ms: u64,
    /// `Set Device` parameters.
    #[cfg_attr(feature = "serde", serde(default))]
    pub device: DeviceParameters,
}

impl BoardProfile {
    /// Create a profile with default timeout and zeroed device parameters.
    pub fn new(
        name: impl Into<String>,
        baud_rate: u32,
        signature: [u8; SIGNATURE_LEN],
        page_size: u16,
    ) -> Self {
        Self {
            name: name.into(),
            baud_rate,
            signature,
            page_size,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            device: DeviceParameters::default(),
        }
    }

    /// Set the `Set Device` parameters.
    #[must_use]
    pub fn with_device(mut self, device: DeviceParameters) -> Self {
        self.device = device;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Response timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The 20 ordered `Set Device` bytes.
    pub fn set_device_payload(&self) -> [u8; DEVICE_PARAMETER_COUNT] {
        self.device.to_bytes()
    }

    /// Flash size from the device parameters, if known.
    pub fn flash_size(&self) -> Option<usize> {
        self.device.flash_size()
    }

    /// Number of pages needed for an image of `len` bytes.
    pub fn page_count(&self, len: usize) -> usize {
        if self.page_size == 0 {
            0
        } else {
            len.div_ceil(usize::from(self.page_size))
        }
    }
}

impl fmt::Display for BoardProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} baud, signature {:02X} {:02X} {:02X}, {}-byte pages)",
            self.name,
            self.baud_rate,
            self.signature[0],
            self.signature[1],
            self.signature[2],
            self.page_size
        )
    }
}

/// ATmega328P signature.
pub const SIGNATURE_ATMEGA328P: [u8; SIGNATURE_LEN] = [0x1E, 0x95, 0x0F];

/// ATmega168 signature.
pub const SIGNATURE_ATMEGA168: [u8; SIGNATURE_LEN] = [0x1E, 0x94, 0x06];

fn atmega328p(name: &str, baud_rate: u32) -> BoardProfile {
    BoardProfile::new(name, baud_rate, SIGNATURE_ATMEGA328P, 128)
        .with_device(DeviceParameters::mega(128, 1024, 32 * 1024))
}

fn atmega168(name: &str, baud_rate: u32) -> BoardProfile {
    BoardProfile::new(name, baud_rate, SIGNATURE_ATMEGA168, 128)
        .with_device(DeviceParameters::mega(128, 512, 16 * 1024))
}

/// Built-in boards that ship with an STK500v1 bootloader.
pub fn builtin_boards() -> Vec<BoardProfile> {
    vec![
        atmega328p("uno", 115_200),
        atmega328p("nano", 115_200),
        atmega328p("nano-old", 57_600),
        atmega328p("duemilanove", 57_600),
        atmega168("duemilanove168", 19_200),
        atmega328p("pro-mini", 57_600),
        atmega328p("lilypad", 57_600),
    ]
}

/// Find a built-in board by name (case-insensitive).
pub fn find_board(name: &str) -> Result<BoardProfile> {
    builtin_boards()
        .into_iter()
        .find(|board| board.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownBoard(name.to_string()))
}
