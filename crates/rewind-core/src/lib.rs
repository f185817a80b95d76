//! Rewind Core - Primitives for rollback netcode
//!
//! This crate provides the small building blocks that the netcode crate
//! composes into sessions:
//!
//! - `Frame` - Signed frame numbers with a null sentinel
//! - `GameInput` - Fixed-capacity input bit buffer, copied by value
//! - `bitvec` - Bit-cursor codec for delta-compressed input packets
//! - `RingBuffer` - Fixed-capacity FIFO with checked push/pop
//! - `NetLog` - Injected logging capability (no global singleton)
//!
//! Everything here is deterministic and allocation-free after construction,
//! so it can be used inside a rollback replay loop without perturbing the
//! simulation.

pub mod bitvec;
mod frame;
mod input;
mod log;
mod ring;

pub use bitvec::{
    clear_bit, read_bit, read_nibblet, set_bit, write_bit, write_nibblet, MAX_COMPRESSED_BITS,
    NIBBLE_BITS,
};
pub use frame::Frame;
pub use input::{GameInput, INPUT_BUFFER_BYTES, MAX_INPUT_BYTES, MAX_INPUT_PLAYERS};
pub use log::{Logger, NetLog, NullLog, TraceLog};
pub use ring::{RingBuffer, RingFull};
