//! Programming session state and step events.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Error;

/// Steps of the programming sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// `Get Sync` handshake.
    Sync,
    /// Read the device signature.
    VerifySignature,
    /// Push the `Set Device` parameter block.
    SetOptions,
    /// Enter programming mode.
    EnterProgrammingMode,
    /// Write the image page by page.
    Upload,
    /// Read the image back page by page.
    Verify,
    /// Leave programming mode.
    ExitProgrammingMode,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "sync",
            Self::VerifySignature => "verify signature",
            Self::SetOptions => "set options",
            Self::EnterProgrammingMode => "enter programming mode",
            Self::Upload => "upload",
            Self::Verify => "verify",
            Self::ExitProgrammingMode => "exit programming mode",
        };
        f.write_str(name)
    }
}

/// Outcome of one step, as recorded in the session timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// The step that ran.
    pub step: Step,
    /// Wall-clock time spent in the step.
    pub elapsed: Duration,
    /// Whether the step succeeded.
    pub ok: bool,
}

/// Events emitted while flashing.
#[derive(Debug)]
pub enum FlashEvent<'a> {
    /// A step is about to run.
    StepStarted(Step),
    /// A step completed.
    StepSucceeded {
        /// The step.
        step: Step,
        /// Time spent in the step.
        elapsed: Duration,
    },
    /// A step failed; the sequence stops here.
    StepFailed {
        /// The step.
        step: Step,
        /// Why it failed.
        error: &'a Error,
    },
    /// One page was written or read back.
    Page {
        /// [`Step::Upload`] or [`Step::Verify`].
        step: Step,
        /// Byte offset of the page start.
        offset: usize,
        /// Bytes in this page.
        len: usize,
        /// Total image length.
        total: usize,
    },
}

/// Receiver of [`FlashEvent`]s.
pub trait FlashObserver {
    /// Handle one event.
    fn on_event(&mut self, event: &FlashEvent<'_>);
}

impl<F> FlashObserver for F
where
    F: FnMut(&FlashEvent<'_>),
{
    fn on_event(&mut self, event: &FlashEvent<'_>) {
        self(event);
    }
}

/// Observer that reports events through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl FlashObserver for LogObserver {
    fn on_event(&mut self, event: &FlashEvent<'_>) {
        match event {
            FlashEvent::StepStarted(step) => info!("Starting {step}"),
            FlashEvent::StepSucceeded { step, elapsed } => {
                debug!("{step} done in {} ms", elapsed.as_millis());
            },
            FlashEvent::StepFailed { step, error } => warn!("{step} failed: {error}"),
            FlashEvent::Page {
                step,
                offset,
                len,
                total,
            } => debug!("{step}: {len} bytes at 0x{offset:04X} ({}/{total})", offset + len),
        }
    }
}

/// Transient state of one flash operation.
#[derive(Debug, Default)]
pub struct ProgrammingSession {
    offset: usize,
    word_address: u16,
    timeline: Vec<StepRecord>,
}

impl ProgrammingSession {
    /// Start a new session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind the page cursor to the start of the image.
    pub fn rewind(&mut self) {
        self.offset = 0;
        self.word_address = 0;
    }

    /// Current byte offset into the image.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Word address last computed for `Load Address`.
    pub fn word_address(&self) -> u16 {
        self.word_address
    }

    /// Compute the word address for the current offset.
    ///
    /// The caller guarantees the image fits the 16-bit word address space.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load_word_address(&mut self) -> u16 {
        self.word_address = (self.offset >> 1) as u16;
        self.word_address
    }

    /// Move the cursor past a page of `len` bytes.
    pub fn advance(&mut self, len: usize) {
        self.offset += len;
    }

    /// Record the outcome of a step.
    pub fn record(&mut self, step: Step, elapsed: Duration, ok: bool) {
        self.timeline.push(StepRecord { step, elapsed, ok });
    }

    /// Steps recorded so far.
    pub fn timeline(&self) -> &[StepRecord] {
        &self.timeline
    }

    /// Consume the session, keeping its timeline.
    pub fn into_timeline(self) -> Vec<StepRecord> {
        self.timeline
    }
}
