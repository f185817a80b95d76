//! Fixed-capacity input bit buffers
//!
//! A `GameInput` is one frame's worth of controller state for every player
//! packed into a small byte array. It is copied by value into queues and
//! onto the wire; the bit-level accessors exist for the delta codec, which
//! transmits only the bits that changed between consecutive frames.

use crate::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum bytes of input per player.
pub const MAX_INPUT_BYTES: usize = 8;

/// Maximum players whose inputs share one `GameInput` buffer.
///
/// `MAX_INPUT_BYTES * MAX_INPUT_PLAYERS * 8` must stay below
/// `1 << NIBBLE_BITS` so a changed-bit index fits in one nibblet on the
/// wire (see the bitvec module).
pub const MAX_INPUT_PLAYERS: usize = 2;

/// Total capacity of the input bit buffer, in bytes.
pub const INPUT_BUFFER_BYTES: usize = MAX_INPUT_BYTES * MAX_INPUT_PLAYERS;

/// One frame of input for up to `MAX_INPUT_PLAYERS` players.
///
/// `size` is the number of meaningful bytes; the remainder of `bits` is
/// always zero. A `frame` of `Frame::NULL` means "no data" (dropped or
/// not-yet-produced input).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GameInput {
    pub frame: Frame,
    pub size: usize,
    pub bits: [u8; INPUT_BUFFER_BYTES],
}

impl GameInput {
    /// Create an input for `frame` from raw bytes. Panics if `data` exceeds
    /// the buffer capacity; sizing is a compile-time decision for the host.
    pub fn new(frame: Frame, data: &[u8]) -> Self {
        assert!(!data.is_empty() && data.len() <= INPUT_BUFFER_BYTES);
        let mut bits = [0u8; INPUT_BUFFER_BYTES];
        bits[..data.len()].copy_from_slice(data);
        Self {
            frame,
            size: data.len(),
            bits,
        }
    }

    /// A zeroed input with a null frame, `size` bytes wide.
    pub fn null(size: usize) -> Self {
        assert!(size > 0 && size <= INPUT_BUFFER_BYTES);
        Self {
            frame: Frame::NULL,
            size,
            bits: [0u8; INPUT_BUFFER_BYTES],
        }
    }

    pub fn is_null(&self) -> bool {
        self.frame.is_null()
    }

    /// Read bit `i` of the buffer.
    pub fn bit(&self, i: usize) -> bool {
        self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set_bit(&mut self, i: usize) {
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn clear_bit(&mut self, i: usize) {
        self.bits[i / 8] &= !(1 << (i % 8));
    }

    /// Zero the entire buffer, keeping frame and size.
    pub fn erase(&mut self) {
        self.bits = [0u8; INPUT_BUFFER_BYTES];
    }

    /// The meaningful bytes of this input.
    pub fn data(&self) -> &[u8] {
        &self.bits[..self.size]
    }

    /// Compare bit patterns only, ignoring the frame number. Used by the
    /// misprediction check and the wire delta encoder.
    pub fn bits_eq(&self, other: &GameInput) -> bool {
        self.size == other.size && self.bits == other.bits
    }
}

impl PartialEq for GameInput {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame && self.bits_eq(other)
    }
}

impl Eq for GameInput {}

impl fmt::Display for GameInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(frame:{} size:{} ", self.frame, self.size)?;
        for byte in self.data() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_copies_bytes() {
        let input = GameInput::new(Frame(3), &[0xab, 0x01]);
        assert_eq!(input.frame, Frame(3));
        assert_eq!(input.size, 2);
        assert_eq!(input.data(), &[0xab, 0x01]);
        assert_eq!(&input.bits[2..], &[0u8; INPUT_BUFFER_BYTES - 2]);
    }

    #[test]
    fn test_bit_accessors() {
        let mut input = GameInput::null(2);
        assert!(!input.bit(9));
        input.set_bit(9);
        assert!(input.bit(9));
        assert_eq!(input.bits[1], 0x02);
        input.clear_bit(9);
        assert!(!input.bit(9));
    }

    #[test]
    fn test_bits_eq_ignores_frame() {
        let a = GameInput::new(Frame(1), &[0x42]);
        let b = GameInput::new(Frame(7), &[0x42]);
        assert!(a.bits_eq(&b));
        assert_ne!(a, b);
        assert_eq!(a, GameInput::new(Frame(1), &[0x42]));
    }

    #[test]
    fn test_erase() {
        let mut input = GameInput::new(Frame(0), &[0xff, 0xff]);
        input.erase();
        assert_eq!(input.data(), &[0x00, 0x00]);
        assert_eq!(input.frame, Frame(0));
    }
}
