//! Error types for rewind-netcode
//!
//! These cover the recoverable, policy-level failures a host can see.
//! Violations of the frame-by-frame calling contract (non-sequential input,
//! reading input past an unresolved misprediction) are panics, not errors:
//! they mean the host broke the protocol, and continuing would only push
//! the simulation further down the wrong path.

use thiserror::Error;

/// Session error type
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The session is replaying frames; local input is not accepted.
    #[error("operation not permitted during rollback")]
    InRollback,

    /// Peers have not finished the initial handshake.
    #[error("session is still synchronizing with remote peers")]
    NotSynchronized,

    /// The handle does not refer to a player in this session.
    #[error("invalid player handle")]
    InvalidPlayerHandle,

    /// Player id outside `1..=num_players`.
    #[error("player id out of range")]
    PlayerOutOfRange,

    /// The prediction window is exhausted; retry on a later tick once the
    /// remote peer catches up.
    #[error("prediction window exhausted, local input rejected")]
    PredictionThreshold,

    /// The player was already disconnected.
    #[error("player already disconnected")]
    PlayerDisconnected,

    /// Spectator limit reached.
    #[error("too many spectators")]
    TooManySpectators,

    /// The request is not valid in the current session state (e.g. adding
    /// a spectator after synchronization started).
    #[error("request not valid in the current session state")]
    InvalidRequest,

    /// The input required for this frame is no longer available (the host
    /// stream ran too far ahead of a spectator).
    #[error("required input for frame {0} is no longer available")]
    InputDropped(i32),

    /// A sync-test replay produced a different checksum than the original
    /// run of the same frame.
    #[error("determinism check failed at frame {frame}: checksum {replayed:?} != {original:?}")]
    Desync {
        frame: i32,
        original: Option<u32>,
        replayed: Option<u32>,
    },
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
