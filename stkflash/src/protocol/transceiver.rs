//! Command transceiver.
//!
//! Sends one [`CommandRequest`] at a time and validates the reply. Every
//! failure is returned wrapped in [`Error::Command`], which records the
//! command and the exact bytes that were sent.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::receiver::receive_frame;
use crate::protocol::stk500::{CommandRequest, hex_string};

/// STK500 command transceiver over a borrowed transport.
pub struct Transceiver<'a, T: Read + Write + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Read + Write + ?Sized> Transceiver<'a, T> {
    /// Create a transceiver over an open transport.
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// Send a command and return its validated response.
    pub fn send(&mut self, request: &CommandRequest) -> Result<Vec<u8>> {
        let frame = request.frame();
        trace!("Sending {}: {}", request.command(), hex_string(&frame));

        self.exchange(request, &frame)
            .map_err(|source| Error::Command {
                command: request.command(),
                frame: hex_string(&frame),
                source: Box::new(source),
            })
    }

    fn exchange(&mut self, request: &CommandRequest, frame: &[u8]) -> Result<Vec<u8>> {
        self.transport
            .write_all(frame)
            .and_then(|()| self.transport.flush())
            .map_err(Error::Transport)?;

        let expect = request.expect();
        debug!(
            "Waiting for {} response ({} bytes)",
            request.command().name(),
            expect.len()
        );
        let response = receive_frame(&mut *self.transport, request.timeout(), expect.len())?;

        if let Some(expected) = expect.bytes() {
            if response != expected {
                return Err(Error::ResponseMismatch {
                    command: request.command(),
                    expected: expected.to_vec(),
                    actual: response,
                });
            }
        }

        Ok(response)
    }

    /// Synchronize with the bootloader.
    ///
    /// Sends `Get Sync` up to `attempts` times in total (at least once) and
    /// returns the first matching acknowledgement. Once the budget is spent the
    /// last attempt's failure is kept as the source of
    /// [`Error::SyncExhausted`].
    pub fn sync(&mut self, attempts: u32, timeout: Duration) -> Result<Vec<u8>> {
        let request = CommandRequest::get_sync(timeout);
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.send(&request) {
                Ok(response) => {
                    debug!("In sync after {attempt} attempt(s)");
                    return Ok(response);
                },
                Err(e) if attempt < attempts => {
                    debug!("Sync attempt {attempt}/{attempts} failed: {e}");
                    attempt += 1;
                },
                Err(e) => {
                    return Err(Error::SyncExhausted {
                        attempts,
                        source: Box::new(e),
                    });
                },
            }
        }
    }
}
