//! Signed frame numbers with a null sentinel
//!
//! Frames are signed because `-1` means "no data yet" throughout the
//! library: a freshly constructed input queue, an input that was dropped by
//! a frame-delay change, and a connection that has not received anything
//! all report `Frame::NULL`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A simulation frame number. `Frame::NULL` (`-1`) means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Frame(pub i32);

impl Frame {
    /// The null sentinel: no frame / no data.
    pub const NULL: Frame = Frame(-1);

    /// Frame zero, the first frame of a session.
    pub const ZERO: Frame = Frame(0);

    pub fn new(value: i32) -> Self {
        Frame(value)
    }

    pub fn is_null(self) -> bool {
        self.0 < 0
    }

    /// The following frame.
    pub fn next(self) -> Frame {
        Frame(self.0 + 1)
    }

    /// The preceding frame. `Frame::ZERO.prev()` is `Frame::NULL`.
    pub fn prev(self) -> Frame {
        Frame(self.0 - 1)
    }

    /// Ring-buffer slot for this frame. Must not be called on a null frame.
    pub fn index(self, capacity: usize) -> usize {
        debug_assert!(!self.is_null());
        self.0 as usize % capacity
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::NULL
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<i32> for Frame {
    fn from(value: i32) -> Self {
        Frame(value)
    }
}
