//! Host callback contract
//!
//! The library never steps the simulation itself; it asks the host to save,
//! load, and advance through [`SessionHandler`]. During a rollback the
//! library brackets each replayed frame itself: it resolves the inputs,
//! invokes `advance_frame` exactly once with them, then saves state. The
//! host must apply the given inputs deterministically and nothing else.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle identifying a player within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerHandle(pub usize);

impl fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player:{}", self.0)
    }
}

/// A host-produced state snapshot. The buffer layout and checksum
/// algorithm are entirely host-defined; the library only stores the bytes
/// and compares checksums for diagnostics and sync-testing.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub checksum: Option<u32>,
}

/// Connection lifecycle notifications delivered from `idle()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote peer answered its first handshake packet.
    Connected { player: PlayerHandle },
    /// Handshake progress with a remote peer.
    Synchronizing {
        player: PlayerHandle,
        count: u32,
        total: u32,
    },
    /// The handshake with a remote peer completed.
    Synchronized { player: PlayerHandle },
    /// All peers are synchronized; the session will now accept input.
    Running,
    /// A remote peer was disconnected (by timeout or request).
    Disconnected { player: PlayerHandle },
    /// The local client is ahead of its peers; sleeping `frames_ahead`
    /// frames would restore fairness.
    TimeSync { frames_ahead: u32 },
    /// No packets from this peer recently; disconnect follows in
    /// `disconnect_timeout` ms unless traffic resumes.
    ConnectionInterrupted {
        player: PlayerHandle,
        disconnect_timeout: u64,
    },
    /// Traffic from an interrupted peer resumed.
    ConnectionResumed { player: PlayerHandle },
}

/// Implemented by the embedding application.
pub trait SessionHandler {
    /// Serialize the current simulation state.
    fn save_state(&mut self) -> Snapshot;

    /// Restore simulation state from a buffer previously returned by
    /// `save_state`.
    fn load_state(&mut self, data: &[u8]);

    /// Step the simulation exactly one frame using `inputs`, which holds
    /// `input_size` bytes per player in player order. Bits set in
    /// `disconnect_flags` mark players whose slice is zero-filled because
    /// they left the session. Called only during rollback replay; normal
    /// frames are driven by the host's own loop.
    fn advance_frame(&mut self, inputs: &[u8], disconnect_flags: u32);

    /// Diagnostic dump of a state buffer. Default: ignored.
    fn log_state(&mut self, _label: &str, _data: &[u8]) {}

    /// Lifecycle notification. Default: ignored.
    fn on_event(&mut self, _event: SessionEvent) {}
}
