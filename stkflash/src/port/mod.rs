//! Serial port abstraction.
//!
//! The protocol layer only needs `Read + Write`. The [`Port`] trait adds the
//! modem control lines and buffer handling used to reset a board into its
//! bootloader.
//!
//! ```text
//! +------------------------+
//! | Stk500Flasher / reset  |
//! +-----------+------------+
//!             |
//!             v
//! +-----------+------------+
//! |       Port trait       |
//! +-----------+------------+
//!             |
//!             v
//! +-----------+------------+
//! | NativePort (serialport)|
//! +------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(&[0x30, 0x20])?;
//!
//!     let mut buf = [0u8; 2];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:02X?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, warn};

use crate::error::Result;

/// Read timeout for ports driven by the frame receiver.
///
/// Each read returns within this interval when no data is pending, so the
/// response deadline is checked at least this often.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Serial port configuration.
///
/// Ports are always opened 8N1 without flow control, as STK500v1 bootloaders
/// expect.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: READ_POLL_INTERVAL,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port with modem control lines.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// A borrowed [`Port`] whose read timeout is clamped to [`READ_POLL_INTERVAL`].
///
/// The frame receiver checks its response deadline between reads, so a port
/// that blocks for longer than the poll interval would stretch every response
/// timeout by its own read timeout. The previous timeout is restored when the
/// guard is dropped.
pub struct PollingPort<'a, P: Port + ?Sized> {
    port: &'a mut P,
    restore: Option<Duration>,
}

impl<'a, P: Port + ?Sized> PollingPort<'a, P> {
    /// Clamp the read timeout of `port` for the lifetime of the guard.
    ///
    /// Ports that already poll at least this often are left untouched.
    pub fn new(port: &'a mut P) -> Result<Self> {
        let previous = port.timeout();
        let restore = if previous.is_zero() || previous > READ_POLL_INTERVAL {
            debug!(
                "Clamping read timeout on {} from {previous:?} to {READ_POLL_INTERVAL:?}",
                port.name()
            );
            port.set_timeout(READ_POLL_INTERVAL)?;
            Some(previous)
        } else {
            None
        };

        Ok(Self { port, restore })
    }

    /// The underlying port.
    pub fn port(&self) -> &P {
        self.port
    }
}

impl<P: Port + ?Sized> Drop for PollingPort<'_, P> {
    fn drop(&mut self) {
        if let Some(timeout) = self.restore.take() {
            if let Err(e) = self.port.set_timeout(timeout) {
                warn!("Failed to restore read timeout on {}: {e}", self.port.name());
            }
        }
    }
}

impl<P: Port + ?Sized> Read for PollingPort<'_, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl<P: Port + ?Sized> Write for PollingPort<'_, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
