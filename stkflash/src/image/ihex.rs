//! Intel HEX firmware images.
//!
//! An Intel HEX file is a sequence of ASCII records:
//!
//! ```text
//! :LLAAAATT<data>CC
//!  |  |   | |     +-- checksum (two's complement of the byte sum)
//!  |  |   | +-------- LL data bytes
//!  |  |   +---------- record type
//!  |  +-------------- 16-bit load offset
//!  +----------------- data length
//! ```
//!
//! Supported record types:
//!
//! | Type | Meaning |
//! |------|---------|
//! | 00 | data |
//! | 01 | end of file |
//! | 02 | extended segment address (base = value << 4) |
//! | 03 | start segment address (ignored) |
//! | 04 | extended linear address (base = value << 16) |
//! | 05 | start linear address (ignored) |
//!
//! The decoded image starts at address 0. Addresses not covered by any data
//! record read as `0xFF`, the erased state of AVR flash.

use std::fmt;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{Error, Result};

/// Value of unprogrammed flash.
pub const FILL_BYTE: u8 = 0xFF;

/// Highest address an image may reach (16 MiB).
const MAX_ADDRESS: usize = 0x100_0000;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// A flat firmware image, starting at flash address 0.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct HexImage {
    data: Vec<u8>,
}

impl HexImage {
    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Load and parse an Intel HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let image = Self::parse(&text)?;
        debug!("Loaded {} bytes from {}", image.len(), path.display());
        Ok(image)
    }

    /// Parse Intel HEX text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut data = Vec::new();
        let mut base = 0usize;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let record = Record::parse(raw).map_err(|reason| Error::InvalidHex { line, reason })?;

            match record.kind {
                RECORD_DATA => {
                    let start = base + usize::from(record.offset);
                    let end = start + record.data.len();
                    if end > MAX_ADDRESS {
                        return Err(Error::InvalidHex {
                            line,
                            reason: format!("address 0x{start:X} is out of range"),
                        });
                    }
                    if data.len() < end {
                        data.resize(end, FILL_BYTE);
                    }
                    data[start..end].copy_from_slice(&record.data);
                },
                RECORD_EOF => return Ok(Self { data }),
                RECORD_EXTENDED_SEGMENT => {
                    base = usize::from(record.address_value(line)?) << 4;
                },
                RECORD_EXTENDED_LINEAR => {
                    base = usize::from(record.address_value(line)?) << 16;
                },
                RECORD_START_SEGMENT | RECORD_START_LINEAR => {},
                other => {
                    return Err(Error::InvalidHex {
                        line,
                        reason: format!("unknown record type 0x{other:02X}"),
                    });
                },
            }
        }

        Err(Error::InvalidHex {
            line: text.lines().count() + 1,
            reason: "missing end-of-file record".to_string(),
        })
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the image holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the image and return its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for HexImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HexImage")
            .field("len", &self.data.len())
            .finish()
    }
}

/// One decoded record.
struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

impl Record {
    fn parse(line: &str) -> std::result::Result<Self, String> {
        let digits = line
            .strip_prefix(':')
            .ok_or_else(|| "record does not start with ':'".to_string())?;
        if digits.len() % 2 != 0 {
            return Err("odd number of hex digits".to_string());
        }

        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| {
                digits
                    .get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| format!("invalid hex digits at column {}", i + 2))
            })
            .collect::<std::result::Result<Vec<u8>, String>>()?;

        // length, offset (2), type, checksum
        if bytes.len() < 5 {
            return Err("record too short".to_string());
        }
        let length = usize::from(bytes[0]);
        if bytes.len() != length + 5 {
            return Err(format!(
                "length field says {length} data bytes, record has {}",
                bytes.len() - 5
            ));
        }

        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            let stored = bytes[bytes.len() - 1];
            let expected = stored.wrapping_sub(sum);
            return Err(format!(
                "checksum mismatch (expected 0x{expected:02X}, found 0x{stored:02X})"
            ));
        }

        Ok(Self {
            kind: bytes[3],
            offset: BigEndian::read_u16(&bytes[1..3]),
            data: bytes[4..4 + length].to_vec(),
        })
    }

    /// The 16-bit value carried by an address record.
    fn address_value(&self, line: usize) -> Result<u16> {
        if self.data.len() != 2 {
            return Err(Error::InvalidHex {
                line,
                reason: format!("address record has {} data bytes", self.data.len()),
            });
        }
        Ok(BigEndian::read_u16(&self.data))
    }
}
