//! Target boards and their programming sequences.

pub mod board;
pub mod stk500v1;

pub use board::{BoardProfile, DeviceParameters, builtin_boards, find_board};
