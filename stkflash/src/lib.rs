//! # stkflash
//!
//! A library for flashing AVR boards through an STK500v1 bootloader
//! (Optiboot, ATmegaBOOT), as found on Arduino Uno, Nano and friends.
//!
//! This crate provides:
//!
//! - Frame assembly for responses arriving in arbitrary chunks
//! - A command transceiver with exact response validation
//! - The programming sequence: sync, signature, device setup, page upload,
//!   page verify
//! - Intel HEX parsing and a table of common boards
//!
//! The protocol layer works over any `Read + Write` transport whose reads
//! return promptly when no data is pending. [`flash`] clamps a serial port's
//! read timeout to [`port::READ_POLL_INTERVAL`] for the session so response
//! deadlines are honoured.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for board profiles
//!
//! ## Example
//!
//! ```rust,no_run
//! use stkflash::{FlashOptions, HexImage, find_board};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let board = find_board("uno")?;
//!     let image = HexImage::from_file("blink.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use stkflash::{NativePort, SerialConfig};
//!
//!         let config = SerialConfig::new("/dev/ttyACM0", board.baud_rate);
//!         let mut port = NativePort::open(&config)?;
//!         stkflash::reset_board(&mut port)?;
//!
//!         let report = stkflash::flash(&mut port, &image, &board, &FlashOptions::for_board(&board))?;
//!         println!("Flashed {} pages", report.pages);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    image::HexImage,
    port::{PollingPort, Port, SerialConfig},
    protocol::{Command, CommandRequest, Expect, FrameReceiver, FrameStatus, Transceiver},
    target::{
        board::{BoardProfile, DeviceParameters, builtin_boards, find_board},
        stk500v1::{
            FlashEvent, FlashObserver, FlashOptions, FlashReport, LogObserver, Stk500Flasher,
            Step, StepRecord, flash, reset_board,
        },
    },
};
