//! Rewind Netcode - Rollback networking sessions
//!
//! A rollback (prediction/replay) netcode library for lockstep-simulated
//! games. Peers exchange only inputs; each machine runs the full
//! simulation, predicts missing remote inputs so the local player never
//! waits, and transparently rolls back and replays when a prediction turns
//! out wrong.
//!
//! The host integrates by implementing [`SessionHandler`] (save, load, and
//! advance its simulation deterministically), supplying a [`Transport`]
//! (any non-blocking datagram socket), and driving one of three session
//! backends from its frame loop:
//!
//! - [`PeerSession`] - full-mesh peer-to-peer play with spectators
//! - [`SpectatorSession`] - follow a host's confirmed input stream
//! - [`SyncTestSession`] - offline determinism verification
//!
//! The per-frame loop against a session looks like:
//!
//! ```text
//! session.add_local_input(handle, &input, &mut game)?;
//! let flags = session.synchronize_input(&mut inputs)?;
//! game.advance_frame(&inputs, flags);      // the host's own step
//! session.advance_frame(&mut game);
//! session.idle(&mut game);                 // whenever there is spare time
//! ```

mod connect_status;
mod error;
mod event;
mod handler;
mod input_queue;
mod message;
mod protocol;
mod session;
mod sync;
mod time_sync;
mod transport;

pub use connect_status::{ConnectStatus, ConnectStatusTable};
pub use error::{Result, SessionError};
pub use handler::{PlayerHandle, SessionEvent, SessionHandler, Snapshot};
pub use input_queue::INPUT_QUEUE_LENGTH;
pub use message::{InputMessage, Message, MessageBody, WireError};
pub use protocol::NetworkStats;
pub use session::{PeerSession, Player, PlayerType, SpectatorSession, SyncTestSession};
pub use transport::Transport;

pub use rewind_core::{Frame, GameInput, INPUT_BUFFER_BYTES, MAX_INPUT_BYTES, MAX_INPUT_PLAYERS};

/// Maximum participants in one session.
pub const MAX_PLAYERS: usize = 4;

/// How many frames a session may run ahead of its slowest confirmed input.
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// Maximum spectators attached to one host.
pub const MAX_SPECTATORS: usize = 32;
