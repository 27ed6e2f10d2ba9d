//! STK500v1 flasher implementation.
//!
//! This module drives an AVR bootloader through the full programming
//! sequence:
//!
//! ```text
//! sync x3 -> read signature -> set device -> enter progmode
//!         -> upload pages -> verify pages -> leave progmode
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{FlashOptions, HexImage, Stk500Flasher, find_board};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let board = find_board("uno")?;
//!     let image = HexImage::from_file("blink.hex")?;
//!
//!     let options = FlashOptions::for_board(&board);
//!     let mut flasher = Stk500Flasher::open("/dev/ttyACM0", board, options)?;
//!     stkflash::reset_board(flasher.transport_mut())?;
//!
//!     let report = flasher.flash(&image)?;
//!     println!("Wrote {} bytes", report.bytes_written);
//!     Ok(())
//! }
//! ```

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::image::HexImage;
use crate::port::{PollingPort, Port};
use crate::protocol::stk500::{CommandRequest, SIGNATURE_LEN};
use crate::protocol::transceiver::Transceiver;
use crate::target::board::{BoardProfile, DEFAULT_TIMEOUT_MS};
use crate::target::stk500v1::session::{
    FlashEvent, FlashObserver, LogObserver, ProgrammingSession, Step, StepRecord,
};

/// Number of back-to-back sync handshakes before talking to the device.
const HANDSHAKE_SYNCS: usize = 3;

/// Default number of attempts per sync handshake.
pub const DEFAULT_SYNC_ATTEMPTS: u32 = 3;

/// Delay after each page, matching the device-side page write time.
pub const PAGE_SETTLE_DELAY: Duration = Duration::from_millis(4);

/// Largest image addressable with a 16-bit word address.
pub const MAX_IMAGE_SIZE: usize = 0x2_0000;

/// How long DTR/RTS are held asserted to reset the board.
const RESET_PULSE: Duration = Duration::from_millis(250);

/// Delay after releasing DTR/RTS before the bootloader listens.
const RESET_SETTLE: Duration = Duration::from_millis(50);

/// Flash operation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOptions {
    /// Response timeout for every command.
    pub timeout: Duration,
    /// Attempts per sync handshake, the first try included.
    pub sync_attempts: u32,
    /// Fail if the device signature differs from the board profile.
    pub check_signature: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            sync_attempts: DEFAULT_SYNC_ATTEMPTS,
            check_signature: false,
        }
    }
}

impl FlashOptions {
    /// Options using the board's response timeout.
    pub fn for_board(board: &BoardProfile) -> Self {
        Self {
            timeout: board.timeout(),
            ..Self::default()
        }
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of attempts per sync handshake.
    #[must_use]
    pub fn with_sync_attempts(mut self, attempts: u32) -> Self {
        self.sync_attempts = attempts;
        self
    }

    /// Enable or disable the signature check.
    #[must_use]
    pub fn with_check_signature(mut self, check: bool) -> Self {
        self.check_signature = check;
        self
    }
}

/// Summary of a successful flash operation.
#[derive(Debug, Clone)]
pub struct FlashReport {
    /// Signature bytes reported by the device.
    pub signature: Vec<u8>,
    /// Bytes written and verified.
    pub bytes_written: usize,
    /// Pages written.
    pub pages: usize,
    /// Per-step outcomes in execution order.
    pub timeline: Vec<StepRecord>,
}

/// STK500v1 flasher.
///
/// Owns the transport for the duration of the session. Pass `&mut port` to
/// keep ownership with the caller. Reads must return within a short interval
/// when no data is pending; wrap serial ports in [`PollingPort`] or use
/// [`Stk500Flasher::open`].
pub struct Stk500Flasher<T: Read + Write> {
    transport: T,
    board: BoardProfile,
    options: FlashOptions,
    observer: Box<dyn FlashObserver>,
}

impl<T: Read + Write> Stk500Flasher<T> {
    /// Create a flasher over an open transport.
    pub fn new(transport: T, board: BoardProfile, options: FlashOptions) -> Self {
        Self {
            transport,
            board,
            options,
            observer: Box::new(LogObserver),
        }
    }

    /// Replace the event observer (defaults to [`LogObserver`]).
    #[must_use]
    pub fn with_observer(mut self, observer: impl FlashObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// The board profile in use.
    pub fn board(&self) -> &BoardProfile {
        &self.board
    }

    /// The options in use.
    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the flasher and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn transceiver(&mut self) -> Transceiver<'_, T> {
        Transceiver::new(&mut self.transport)
    }

    /// Run the full programming sequence for `image`.
    ///
    /// The first failing step aborts the sequence; no rollback is attempted.
    pub fn flash(&mut self, image: &HexImage) -> Result<FlashReport> {
        self.check_image(image)?;
        info!(
            "Flashing {} bytes to {} ({} pages)",
            image.len(),
            self.board.name,
            self.board.page_count(image.len())
        );

        let mut session = ProgrammingSession::new();

        for _ in 0..HANDSHAKE_SYNCS {
            self.run_step(&mut session, Step::Sync, |f, _| f.sync().map(drop))?;
        }
        let signature =
            self.run_step(&mut session, Step::VerifySignature, |f, _| f.verify_signature())?;
        self.run_step(&mut session, Step::SetOptions, |f, _| f.set_options())?;
        self.run_step(&mut session, Step::EnterProgrammingMode, |f, _| {
            f.enter_programming_mode()
        })?;
        let pages = self.run_step(&mut session, Step::Upload, |f, s| {
            f.transfer_pages(image.as_bytes(), s, Step::Upload)
        })?;
        self.run_step(&mut session, Step::Verify, |f, s| {
            f.transfer_pages(image.as_bytes(), s, Step::Verify)
        })?;
        self.run_step(&mut session, Step::ExitProgrammingMode, |f, _| {
            f.exit_programming_mode()
        })?;

        info!("Flashing complete!");
        Ok(FlashReport {
            signature,
            bytes_written: image.len(),
            pages,
            timeline: session.into_timeline(),
        })
    }

    /// Run one step: emit events, record the outcome and add step context.
    fn run_step<R>(
        &mut self,
        session: &mut ProgrammingSession,
        step: Step,
        action: impl FnOnce(&mut Self, &mut ProgrammingSession) -> Result<R>,
    ) -> Result<R> {
        self.observer.on_event(&FlashEvent::StepStarted(step));
        let start = Instant::now();
        let result = action(self, session);
        let elapsed = start.elapsed();
        session.record(step, elapsed, result.is_ok());

        match result {
            Ok(value) => {
                self.observer
                    .on_event(&FlashEvent::StepSucceeded { step, elapsed });
                Ok(value)
            },
            Err(error) => {
                self.observer
                    .on_event(&FlashEvent::StepFailed { step, error: &error });
                Err(Error::Step {
                    step,
                    source: Box::new(error),
                })
            },
        }
    }

    fn check_image(&self, image: &HexImage) -> Result<()> {
        if self.board.page_size == 0 {
            return Err(Error::InvalidImage(format!(
                "board {} has a page size of 0",
                self.board.name
            )));
        }
        if image.len() > MAX_IMAGE_SIZE {
            return Err(Error::InvalidImage(format!(
                "{} bytes exceeds the {MAX_IMAGE_SIZE}-byte word address range",
                image.len()
            )));
        }
        if let Some(flash_size) = self.board.flash_size() {
            if image.len() > flash_size {
                return Err(Error::InvalidImage(format!(
                    "{} bytes does not fit the {flash_size}-byte flash of {}",
                    image.len(),
                    self.board.name
                )));
            }
        }
        Ok(())
    }

    /// Synchronize with the bootloader once.
    pub fn sync(&mut self) -> Result<Vec<u8>> {
        let attempts = self.options.sync_attempts;
        let timeout = self.options.timeout;
        self.transceiver().sync(attempts, timeout)
    }

    /// Read the device signature frame (`INSYNC sig0 sig1 sig2 OK`).
    ///
    /// The content is only compared against the board profile when
    /// [`FlashOptions::check_signature`] is set.
    pub fn verify_signature(&mut self) -> Result<Vec<u8>> {
        let request = CommandRequest::read_signature(self.options.timeout);
        let response = self.transceiver().send(&request)?;
        let signature = response[1..=SIGNATURE_LEN].to_vec();
        debug!(
            "Device signature: {:02X} {:02X} {:02X}",
            signature[0], signature[1], signature[2]
        );

        if self.options.check_signature && signature != self.board.signature {
            return Err(Error::SignatureMismatch {
                expected: self.board.signature.to_vec(),
                actual: signature,
            });
        }
        Ok(signature)
    }

    /// Push the board's `Set Device` parameter block.
    pub fn set_options(&mut self) -> Result<()> {
        let request =
            CommandRequest::set_device(self.board.set_device_payload(), self.options.timeout);
        self.transceiver().send(&request).map(drop)
    }

    /// Enter programming mode.
    pub fn enter_programming_mode(&mut self) -> Result<()> {
        let request = CommandRequest::enter_progmode(self.options.timeout);
        self.transceiver().send(&request).map(drop)
    }

    /// Leave programming mode.
    pub fn exit_programming_mode(&mut self) -> Result<()> {
        let request = CommandRequest::leave_progmode(self.options.timeout);
        self.transceiver().send(&request).map(drop)
    }

    /// Write `image` page by page. Returns the number of pages written.
    pub fn upload(&mut self, image: &HexImage) -> Result<usize> {
        self.check_image(image)?;
        let mut session = ProgrammingSession::new();
        self.transfer_pages(image.as_bytes(), &mut session, Step::Upload)
    }

    /// Read `image` back page by page and compare. Returns the number of pages.
    pub fn verify(&mut self, image: &HexImage) -> Result<usize> {
        self.check_image(image)?;
        let mut session = ProgrammingSession::new();
        self.transfer_pages(image.as_bytes(), &mut session, Step::Verify)
    }

    /// Shared page loop of upload and verify.
    fn transfer_pages(
        &mut self,
        data: &[u8],
        session: &mut ProgrammingSession,
        step: Step,
    ) -> Result<usize> {
        let page_size = usize::from(self.board.page_size);
        let timeout = self.options.timeout;
        let mut pages = 0;

        session.rewind();
        while session.offset() < data.len() {
            let offset = session.offset();
            let word_address = session.load_word_address();
            self.transceiver()
                .send(&CommandRequest::load_address(word_address, timeout))?;

            let page = page_slice(data, offset, page_size);
            let request = match step {
                Step::Verify => CommandRequest::read_page(page, timeout),
                _ => CommandRequest::prog_page(page, timeout),
            };
            self.transceiver().send(&request)?;

            session.advance(page.len());
            pages += 1;
            self.observer.on_event(&FlashEvent::Page {
                step,
                offset,
                len: page.len(),
                total: data.len(),
            });
            thread::sleep(PAGE_SETTLE_DELAY);
        }

        debug!("{step} done: {pages} pages");
        Ok(pages)
    }
}

/// The page starting at `offset`, clipped to the end of the image.
fn page_slice(data: &[u8], offset: usize, page_size: usize) -> &[u8] {
    let end = offset.saturating_add(page_size).min(data.len());
    &data[offset..end]
}

/// Flash `image` over `port` with the given board profile.
///
/// This is the single-call entry point; use [`Stk500Flasher`] directly to
/// attach an observer or run steps individually. The port's read timeout is
/// clamped to [`READ_POLL_INTERVAL`](crate::port::READ_POLL_INTERVAL) for the
/// session and restored afterwards.
pub fn flash<P: Port + ?Sized>(
    port: &mut P,
    image: &HexImage,
    board: &BoardProfile,
    options: &FlashOptions,
) -> Result<FlashReport> {
    let transport = PollingPort::new(port)?;
    Stk500Flasher::new(transport, board.clone(), options.clone()).flash(image)
}

/// Reset the board by pulsing DTR and RTS.
///
/// Boards with an auto-reset circuit restart into the bootloader, which then
/// listens for a short window.
pub fn reset_board<P: Port + ?Sized>(port: &mut P) -> Result<()> {
    debug!("Resetting board on {}", port.name());
    port.set_dtr(true)?;
    port.set_rts(true)?;
    thread::sleep(RESET_PULSE);
    port.set_dtr(false)?;
    port.set_rts(false)?;
    thread::sleep(RESET_SETTLE);
    port.clear_buffers()
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{BoardProfile, Error, FlashOptions, Result, Stk500Flasher, thread};
    use crate::port::{NativePort, READ_POLL_INTERVAL, SerialConfig};
    use log::{debug, warn};
    use std::time::Duration;

    impl Stk500Flasher<NativePort> {
        /// Open a serial port at the board's baud rate and create a flasher.
        ///
        /// The port uses a short read timeout so response deadlines are
        /// checked frequently.
        pub fn open(port_name: &str, board: BoardProfile, options: FlashOptions) -> Result<Self> {
            let baud_rate = board.baud_rate;
            Self::open_with_baud(port_name, baud_rate, board, options)
        }

        /// Like [`Stk500Flasher::open`] with an explicit baud rate.
        pub fn open_with_baud(
            port_name: &str,
            baud_rate: u32,
            board: BoardProfile,
            options: FlashOptions,
        ) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let config = SerialConfig::new(port_name, baud_rate).with_timeout(READ_POLL_INTERVAL);
            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                match NativePort::open(&config) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(port, board, options));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or_else(|| Error::Config(format!("cannot open {port_name}"))))
        }
    }
}
