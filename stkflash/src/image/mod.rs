//! Firmware image formats.

pub mod ihex;

pub use ihex::HexImage;
