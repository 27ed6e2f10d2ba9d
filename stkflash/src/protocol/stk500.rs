//! STK500 version 1 commands and constants.
//!
//! Every command the host sends has the same shape: an opcode, an optional
//! payload and the `Sync_CRC_EOP` terminator. Every reply starts with
//! `Resp_STK_INSYNC` and, for the commands used here, ends with `Resp_STK_OK`.
//!
//! ```text
//! host -> device:  +--------+-----------------+------+
//!                  | opcode |     payload     | 0x20 |
//!                  +--------+-----------------+------+
//!
//! device -> host:  +------+-----------------+------+
//!                  | 0x14 |  data (if any)  | 0x10 |
//!                  +------+-----------------+------+
//! ```

use std::fmt;
use std::time::Duration;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

/// `Resp_STK_INSYNC`: first byte of every reply (start-of-frame marker).
pub const RESP_STK_INSYNC: u8 = 0x14;

/// `Resp_STK_OK`: last byte of a successful reply.
pub const RESP_STK_OK: u8 = 0x10;

/// `Sync_CRC_EOP`: terminator of every command frame.
pub const SYNC_CRC_EOP: u8 = 0x20;

/// Memory type byte selecting flash for page commands (`'F'`).
pub const MEMTYPE_FLASH: u8 = b'F';

/// Acknowledgement for commands without response data.
pub const OK_RESPONSE: [u8; 2] = [RESP_STK_INSYNC, RESP_STK_OK];

/// Length of an AVR device signature.
pub const SIGNATURE_LEN: usize = 3;

/// Number of parameter bytes carried by `Set Device`.
pub const DEVICE_PARAMETER_COUNT: usize = 20;

/// STK500v1 command opcodes used by the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// `Cmnd_STK_GET_SYNC` (0x30).
    GetSync = 0x30,
    /// `Cmnd_STK_SET_DEVICE` (0x42).
    SetDevice = 0x42,
    /// `Cmnd_STK_ENTER_PROGMODE` (0x50).
    EnterProgmode = 0x50,
    /// `Cmnd_STK_LEAVE_PROGMODE` (0x51).
    LeaveProgmode = 0x51,
    /// `Cmnd_STK_LOAD_ADDRESS` (0x55).
    LoadAddress = 0x55,
    /// `Cmnd_STK_PROG_PAGE` (0x64).
    ProgPage = 0x64,
    /// `Cmnd_STK_READ_PAGE` (0x74).
    ReadPage = 0x74,
    /// `Cmnd_STK_READ_SIGN` (0x75).
    ReadSign = 0x75,
}

impl Command {
    /// The opcode byte.
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Human-readable command name.
    pub fn name(self) -> &'static str {
        match self {
            Self::GetSync => "Get Sync",
            Self::SetDevice => "Set Device",
            Self::EnterProgmode => "Enter Progmode",
            Self::LeaveProgmode => "Leave Progmode",
            Self::LoadAddress => "Load Address",
            Self::ProgPage => "Prog Page",
            Self::ReadPage => "Read Page",
            Self::ReadSign => "Read Signature",
        }
    }

    /// Look up a command from its opcode.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x30 => Some(Self::GetSync),
            0x42 => Some(Self::SetDevice),
            0x50 => Some(Self::EnterProgmode),
            0x51 => Some(Self::LeaveProgmode),
            0x55 => Some(Self::LoadAddress),
            0x64 => Some(Self::ProgPage),
            0x74 => Some(Self::ReadPage),
            0x75 => Some(Self::ReadSign),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.opcode())
    }
}

/// How the transceiver decides a response is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Await exactly these bytes and compare them.
    Bytes(Vec<u8>),
    /// Await this many bytes without comparing content.
    Length(usize),
}

impl Expect {
    /// Number of response bytes to await.
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Length(len) => *len,
        }
    }

    /// Returns `true` if no response bytes are awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The exact bytes to compare against, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Length(_) => None,
        }
    }
}

/// A single STK500 command and the response it expects.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    command: Command,
    payload: Vec<u8>,
    terminator: Option<u8>,
    expect: Expect,
    timeout: Duration,
}

impl CommandRequest {
    /// Create a request with an empty payload that expects the OK acknowledgement.
    pub fn new(command: Command, timeout: Duration) -> Self {
        Self {
            command,
            payload: Vec::new(),
            terminator: None,
            expect: Expect::Bytes(OK_RESPONSE.to_vec()),
            timeout,
        }
    }

    /// Set the payload bytes following the opcode.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Replace the frame terminator (defaults to `Sync_CRC_EOP`).
    #[must_use]
    pub fn with_terminator(mut self, terminator: u8) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Set the expected response.
    #[must_use]
    pub fn with_expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    /// `Get Sync`, answered with `INSYNC OK`.
    pub fn get_sync(timeout: Duration) -> Self {
        Self::new(Command::GetSync, timeout)
    }

    /// `Read Signature`, answered with `INSYNC sig0 sig1 sig2 OK`.
    pub fn read_signature(timeout: Duration) -> Self {
        Self::new(Command::ReadSign, timeout).with_expect(Expect::Length(SIGNATURE_LEN + 2))
    }

    /// `Set Device` with the 20 ordered device parameter bytes.
    pub fn set_device(parameters: [u8; DEVICE_PARAMETER_COUNT], timeout: Duration) -> Self {
        Self::new(Command::SetDevice, timeout).with_payload(parameters.to_vec())
    }

    /// `Enter Progmode`.
    pub fn enter_progmode(timeout: Duration) -> Self {
        Self::new(Command::EnterProgmode, timeout)
    }

    /// `Leave Progmode`.
    pub fn leave_progmode(timeout: Duration) -> Self {
        Self::new(Command::LeaveProgmode, timeout)
    }

    /// `Load Address` with a word address, low byte first.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn load_address(word_address: u16, timeout: Duration) -> Self {
        let mut payload = Vec::with_capacity(2);
        payload.write_u16::<LittleEndian>(word_address).unwrap();
        Self::new(Command::LoadAddress, timeout).with_payload(payload)
    }

    /// `Prog Page` for flash: byte count (high, low), memory type, data.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn prog_page(data: &[u8], timeout: Duration) -> Self {
        let mut payload = Vec::with_capacity(data.len() + 3);
        // Safe cast: pages are bounded by the u16 page size
        payload.write_u16::<BigEndian>(data.len() as u16).unwrap();
        payload.push(MEMTYPE_FLASH);
        payload.extend_from_slice(data);
        Self::new(Command::ProgPage, timeout).with_payload(payload)
    }

    /// `Read Page` for flash, expecting the device to echo `expected` exactly.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn read_page(expected: &[u8], timeout: Duration) -> Self {
        let mut payload = Vec::with_capacity(3);
        payload.write_u16::<BigEndian>(expected.len() as u16).unwrap();
        payload.push(MEMTYPE_FLASH);

        let mut response = Vec::with_capacity(expected.len() + 2);
        response.push(RESP_STK_INSYNC);
        response.extend_from_slice(expected);
        response.push(RESP_STK_OK);

        Self::new(Command::ReadPage, timeout)
            .with_payload(payload)
            .with_expect(Expect::Bytes(response))
    }

    /// The command being sent.
    pub fn command(&self) -> Command {
        self.command
    }

    /// The payload following the opcode.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The expected response.
    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    /// Receive timeout for the response.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the complete outgoing frame.
    pub fn frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 2);
        buf.push(self.command.opcode());
        buf.extend_from_slice(&self.payload);
        buf.push(self.terminator.unwrap_or(SYNC_CRC_EOP));
        buf
    }
}

/// Render bytes as space-separated lowercase hex.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
