//! Session backends
//!
//! Three frontends over the same synchronization core: [`PeerSession`] for
//! a full-mesh peer-to-peer game, [`SpectatorSession`] for a read-only
//! client following one host, and [`SyncTestSession`] for offline
//! determinism checking of the host's save/load/advance callbacks.

mod peer;
mod spectator;

pub use peer::PeerSession;
pub use spectator::SpectatorSession;
pub use sync_test::SyncTestSession;

use std::net::SocketAddr;

/// Where a player's inputs come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerType {
    /// Inputs are produced on this machine.
    Local,
    /// Inputs arrive over the network from `addr`.
    Remote { addr: SocketAddr },
    /// Receives the input stream but contributes none.
    Spectator { addr: SocketAddr },
}

/// A participant to register with [`PeerSession::add_player`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Player {
    pub player_type: PlayerType,
    /// 1-based seat number, `1..=num_players`. Ignored for spectators.
    pub player_id: usize,
}

impl Player {
    pub fn local(player_id: usize) -> Self {
        Self {
            player_type: PlayerType::Local,
            player_id,
        }
    }

    pub fn remote(player_id: usize, addr: SocketAddr) -> Self {
        Self {
            player_type: PlayerType::Remote { addr },
            player_id,
        }
    }

    pub fn spectator(addr: SocketAddr) -> Self {
        Self {
            player_type: PlayerType::Spectator { addr },
            player_id: 0,
        }
    }
}
