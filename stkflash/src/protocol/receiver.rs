//! Response frame receiver.
//!
//! Serial reads arrive in arbitrary chunk sizes. [`FrameReceiver`] holds the
//! assembly state for one response and is fed chunk by chunk; [`receive_frame`]
//! drives it from a reader under a deadline.
//!
//! Bytes before the first `Resp_STK_INSYNC` are line noise (bootloader
//! banners, stale replies) and are dropped. From the marker on, everything is
//! part of the frame.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{Error, Result};
use crate::protocol::stk500::{RESP_STK_INSYNC, hex_string};

/// Size of the scratch buffer used for each read.
const CHUNK_SIZE: usize = 256;

/// Outcome of feeding a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// More bytes are needed.
    Pending,
    /// The frame has reached the expected length.
    Complete,
}

/// Assembly state for a single response frame.
#[derive(Debug)]
pub struct FrameReceiver {
    expected: usize,
    buffer: Vec<u8>,
    synchronized: bool,
}

impl FrameReceiver {
    /// Create a receiver waiting for `expected` bytes, marker included.
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            buffer: Vec::with_capacity(expected),
            synchronized: false,
        }
    }

    /// Feed one chunk from the transport.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<FrameStatus> {
        let data = if self.synchronized {
            chunk
        } else {
            match chunk.iter().position(|&b| b == RESP_STK_INSYNC) {
                Some(start) => {
                    if start > 0 {
                        trace!("Dropped {start} bytes before INSYNC");
                    }
                    self.synchronized = true;
                    &chunk[start..]
                },
                None => {
                    if !chunk.is_empty() {
                        trace!("Dropped {} bytes while waiting for INSYNC", chunk.len());
                    }
                    return Ok(FrameStatus::Pending);
                },
            }
        };

        self.buffer.extend_from_slice(data);

        if self.buffer.len() > self.expected {
            Err(Error::BufferOverflow {
                received: self.buffer.len(),
                expected: self.expected,
            })
        } else if self.buffer.len() == self.expected {
            Ok(FrameStatus::Complete)
        } else {
            Ok(FrameStatus::Pending)
        }
    }

    /// Whether the start marker has been seen.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Number of bytes assembled so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing has been assembled yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Expected frame length.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Consume the receiver and return the assembled bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Returns `true` for read errors that only mean "no data yet".
fn is_idle_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Read one response frame of `expected` bytes from `reader`.
///
/// The deadline is checked before every read, so once `timeout` has elapsed no
/// further read is issued. A zero `timeout` disables the deadline. A read in
/// progress is not interrupted, so readers should return within a short poll
/// interval when no data is pending; wrap serial ports in
/// [`PollingPort`](crate::port::PollingPort).
///
/// End of stream before the frame completes is reported as
/// [`Error::IncompleteResponse`].
pub fn receive_frame<R: Read + ?Sized>(
    reader: &mut R,
    timeout: Duration,
    expected: usize,
) -> Result<Vec<u8>> {
    let mut receiver = FrameReceiver::new(expected);
    if expected == 0 {
        return Ok(receiver.into_bytes());
    }

    let start = Instant::now();
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let elapsed = start.elapsed();
        if !timeout.is_zero() && elapsed >= timeout {
            return Err(Error::Timeout { elapsed });
        }

        match reader.read(&mut chunk) {
            Ok(0) => {
                return Err(Error::IncompleteResponse {
                    received: receiver.len(),
                    expected,
                });
            },
            Ok(n) => {
                trace!("Received chunk: {}", hex_string(&chunk[..n]));
                if receiver.feed(&chunk[..n])? == FrameStatus::Complete {
                    return Ok(receiver.into_bytes());
                }
            },
            Err(e) if is_idle_read(&e) => {},
            Err(e) => return Err(Error::Transport(e)),
        }
    }
}
