//! Error types for stkflash.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::stk500::{Command, hex_string};
use crate::target::stk500v1::Step;

/// Result type for stkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Reading from or writing to the transport failed.
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    /// No complete response arrived within the configured window.
    #[error("Timeout: no complete response after {} ms", .elapsed.as_millis())]
    Timeout {
        /// Time spent waiting before giving up.
        elapsed: Duration,
    },

    /// More bytes arrived than the command expects.
    #[error("Buffer overflow: received {received} bytes, expected {expected}")]
    BufferOverflow {
        /// Bytes buffered when the overflow was detected.
        received: usize,
        /// Expected response length.
        expected: usize,
    },

    /// The transport reached end-of-stream before the response was complete.
    #[error("Incomplete response: received {received} of {expected} bytes before end of stream")]
    IncompleteResponse {
        /// Bytes buffered before the stream ended.
        received: usize,
        /// Expected response length.
        expected: usize,
    },

    /// The response differs from the exact expected bytes.
    #[error(
        "{command} response mismatch: got [{}], expected [{}]",
        hex_string(.actual),
        hex_string(.expected)
    )]
    ResponseMismatch {
        /// Command whose response was rejected.
        command: Command,
        /// Expected response bytes.
        expected: Vec<u8>,
        /// Received response bytes.
        actual: Vec<u8>,
    },

    /// The sync handshake failed on every attempt.
    #[error("Sync failed after {attempts} attempts: {source}")]
    SyncExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Failure of the last attempt.
        #[source]
        source: Box<Error>,
    },

    /// The device signature does not match the board profile.
    #[error(
        "Signature mismatch: device reports [{}], board expects [{}]",
        hex_string(.actual),
        hex_string(.expected)
    )]
    SignatureMismatch {
        /// Signature from the board profile.
        expected: Vec<u8>,
        /// Signature read from the device.
        actual: Vec<u8>,
    },

    /// A command failed; carries the frame that was sent.
    #[error("Sending {command} [{frame}]: {source}")]
    Command {
        /// Command being sent.
        command: Command,
        /// Hex rendering of the outgoing frame.
        frame: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A programming step failed.
    #[error("{step} failed: {source}")]
    Step {
        /// Step that failed.
        step: Step,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Malformed Intel HEX input.
    #[error("Invalid HEX at line {line}: {reason}")]
    InvalidHex {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the record.
        reason: String,
    },

    /// The image cannot be programmed with the given board profile.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// No board profile with the given name.
    #[error("Unknown board: {0}")]
    UnknownBoard(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the innermost error, looking through command and step context.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Command { source, .. } | Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the step that failed, if this error carries step context.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_context() {
        let err = Error::Step {
            step: Step::Sync,
            source: Box::new(Error::Command {
                command: Command::GetSync,
                frame: "30 20".into(),
                source: Box::new(Error::Timeout {
                    elapsed: Duration::from_millis(400),
                }),
            }),
        };

        assert!(matches!(err.root_cause(), Error::Timeout { .. }));
        assert_eq!(err.step(), Some(Step::Sync));
    }

    #[test]
    fn test_mismatch_renders_hex() {
        let err = Error::ResponseMismatch {
            command: Command::EnterProgmode,
            expected: vec![0x14, 0x10],
            actual: vec![0x14, 0x12],
        };
        let text = err.to_string();
        assert!(text.contains("14 12"));
        assert!(text.contains("14 10"));
        assert!(text.contains("Enter Progmode"));
    }

    #[test]
    fn test_command_error_keeps_source() {
        use std::error::Error as _;

        let err = Error::Command {
            command: Command::LoadAddress,
            frame: "55 00 00 20".into(),
            source: Box::new(Error::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "unplugged",
            ))),
        };

        assert!(err.to_string().contains("55 00 00 20"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_sync_exhausted_reports_last_failure() {
        use std::error::Error as _;

        let err = Error::SyncExhausted {
            attempts: 3,
            source: Box::new(Error::Timeout {
                elapsed: Duration::from_millis(400),
            }),
        };

        let text = err.to_string();
        assert!(text.contains("3 attempts"));
        assert!(text.contains("400 ms"));
        assert!(err.source().is_some());
    }
}
