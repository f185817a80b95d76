//! Events surfaced by a peer protocol endpoint
//!
//! The endpoint queues these as it processes packets; the session drains
//! them each `idle()` tick and translates most into [`SessionEvent`]s for
//! the host. `Input` stays internal: the session feeds it straight into the
//! synchronization layer.
//!
//! [`SessionEvent`]: crate::SessionEvent

use rewind_core::GameInput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// First reply received from the peer.
    Connected,
    /// Handshake roundtrip `count` of `total` completed.
    Synchronizing { total: u32, count: u32 },
    /// Handshake finished; the endpoint is now running.
    Synchronized,
    /// A remote input decoded from an input packet.
    Input(GameInput),
    /// The peer was disconnected.
    Disconnected,
    /// No traffic from the peer; disconnect follows in `disconnect_timeout`
    /// ms unless packets resume.
    NetworkInterrupted { disconnect_timeout: u64 },
    /// Traffic resumed after an interruption.
    NetworkResumed,
}
