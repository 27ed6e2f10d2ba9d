//! STK500 version 1 bootloader support.
//!
//! Used by the Optiboot and ATmegaBOOT bootloaders on Arduino boards.

pub mod flasher;
pub mod session;

pub use flasher::{
    FlashOptions, FlashReport, MAX_IMAGE_SIZE, PAGE_SETTLE_DELAY, Stk500Flasher, flash,
    reset_board,
};
pub use session::{FlashEvent, FlashObserver, LogObserver, ProgrammingSession, Step, StepRecord};
