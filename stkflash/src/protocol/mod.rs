//! STK500v1 protocol implementation.

pub mod receiver;
pub mod stk500;
pub mod transceiver;

// Re-export common types
pub use receiver::{FrameReceiver, FrameStatus, receive_frame};
pub use stk500::{Command, CommandRequest, Expect};
pub use transceiver::Transceiver;
