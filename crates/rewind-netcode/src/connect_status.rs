//! Per-player connect status
//!
//! Every input packet carries a snapshot of the sender's view of all
//! players' `(disconnected, last_frame)` pairs, so a disconnect observed by
//! one peer propagates transitively through every pairwise connection.
//!
//! The table of local statuses is owned by the session and handed to
//! protocol calls as an explicit argument. Nothing holds a long-lived
//! shared reference to it.

use crate::MAX_PLAYERS;
use rewind_core::Frame;
use serde::{Deserialize, Serialize};

/// One player's connection status as seen by some peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectStatus {
    pub disconnected: bool,
    pub last_frame: Frame,
}

impl Default for ConnectStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

impl ConnectStatus {
    /// Wire form: bit 0 is the disconnected flag, the remaining bits are
    /// the last frame. The arithmetic shift on unpack preserves the `-1`
    /// null sentinel.
    pub fn pack(self) -> u32 {
        ((self.last_frame.0 as u32) << 1) | u32::from(self.disconnected)
    }

    pub fn unpack(raw: u32) -> Self {
        Self {
            disconnected: raw & 1 != 0,
            last_frame: Frame((raw as i32) >> 1),
        }
    }
}

/// Session-owned table of local connect statuses, one entry per player.
#[derive(Debug, Clone, Default)]
pub struct ConnectStatusTable {
    entries: [ConnectStatus; MAX_PLAYERS],
}

impl ConnectStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, player: usize) -> ConnectStatus {
        self.entries[player]
    }

    pub fn set_last_frame(&mut self, player: usize, frame: Frame) {
        self.entries[player].last_frame = frame;
    }

    pub fn set_disconnected(&mut self, player: usize, frame: Frame) {
        self.entries[player].disconnected = true;
        self.entries[player].last_frame = frame;
    }

    /// Snapshot for embedding in an outbound input packet.
    pub fn snapshot(&self) -> [ConnectStatus; MAX_PLAYERS] {
        self.entries
    }
}
