//! Peer-to-peer session backend
//!
//! Full mesh: every remote player gets its own protocol endpoint, and every
//! local input is broadcast to all of them. The session owns the
//! authoritative connect-status table, computes the globally confirmed
//! frame from everyone's acks, feeds confirmed input to spectators, and
//! drives the rollback core when a remote input contradicts a prediction.

use crate::connect_status::ConnectStatusTable;
use crate::event::ProtocolEvent;
use crate::handler::{PlayerHandle, SessionEvent, SessionHandler};
use crate::message::Message;
use crate::protocol::{NetworkStats, PeerProtocol};
use crate::session::{Player, PlayerType};
use crate::sync::{SyncConfig, Synchronizer};
use crate::transport::Transport;
use crate::{Result, SessionError, MAX_PLAYERS, MAX_PREDICTION_FRAMES, MAX_SPECTATORS};
use rewind_core::{Frame, GameInput, Logger, NullLog, INPUT_BUFFER_BYTES};
use std::cmp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// How often (in frames) a fresh time-sync recommendation may be issued.
const RECOMMENDATION_INTERVAL: i32 = 240;

const DEFAULT_DISCONNECT_TIMEOUT: u64 = 5000;
const DEFAULT_DISCONNECT_NOTIFY_START: u64 = 750;

/// Spectator handles live above this offset so they can never collide with
/// player handles.
const SPECTATOR_HANDLE_BASE: usize = 1000;

pub struct PeerSession<T: Transport> {
    transport: T,
    sync: Synchronizer,
    endpoints: Vec<Option<PeerProtocol>>,
    spectators: Vec<PeerProtocol>,

    num_players: usize,
    input_size: usize,

    local_connect_status: ConnectStatusTable,
    synchronizing: bool,
    next_recommended_sleep: i32,
    next_spectator_frame: Frame,

    disconnect_timeout: u64,
    disconnect_notify_start: u64,

    start: Instant,
    log: Logger,
}

impl<T: Transport> PeerSession<T> {
    pub fn new(transport: T, num_players: usize, input_size: usize) -> Self {
        Self::with_logger(transport, num_players, input_size, Arc::new(NullLog))
    }

    pub fn with_logger(
        transport: T,
        num_players: usize,
        input_size: usize,
        log: Logger,
    ) -> Self {
        assert!(num_players >= 1 && num_players <= MAX_PLAYERS);
        assert!(input_size > 0 && num_players * input_size <= INPUT_BUFFER_BYTES);
        let sync = Synchronizer::with_logger(
            SyncConfig {
                num_players,
                input_size,
                max_prediction_frames: MAX_PREDICTION_FRAMES,
            },
            log.clone(),
        );
        Self {
            transport,
            sync,
            endpoints: (0..num_players).map(|_| None).collect(),
            spectators: Vec::new(),
            num_players,
            input_size,
            local_connect_status: ConnectStatusTable::new(),
            synchronizing: true,
            next_recommended_sleep: 0,
            next_spectator_frame: Frame::ZERO,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            start: Instant::now(),
            log,
        }
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn queue_to_handle(queue: usize) -> PlayerHandle {
        PlayerHandle(queue + 1)
    }

    fn handle_to_queue(&self, player: PlayerHandle) -> Result<usize> {
        if player.0 >= 1 && player.0 <= self.num_players {
            Ok(player.0 - 1)
        } else {
            Err(SessionError::InvalidPlayerHandle)
        }
    }

    /// Register a participant. Remote players start their handshake
    /// immediately; the session raises `Running` once every endpoint has
    /// synchronized.
    pub fn add_player(&mut self, player: Player) -> Result<PlayerHandle> {
        match player.player_type {
            PlayerType::Spectator { addr } => self.add_spectator(addr),
            PlayerType::Local => {
                let queue = self.check_player_id(player.player_id)?;
                Ok(Self::queue_to_handle(queue))
            }
            PlayerType::Remote { addr } => {
                let queue = self.check_player_id(player.player_id)?;
                let mut endpoint =
                    PeerProtocol::with_logger(addr, self.input_size, self.log.clone());
                endpoint.set_disconnect_timeout(self.disconnect_timeout);
                endpoint.set_disconnect_notify_start(self.disconnect_notify_start);
                endpoint.synchronize(self.now(), &self.transport);
                self.endpoints[queue] = Some(endpoint);
                self.synchronizing = true;
                Ok(Self::queue_to_handle(queue))
            }
        }
    }

    fn check_player_id(&self, player_id: usize) -> Result<usize> {
        if player_id < 1 || player_id > self.num_players {
            return Err(SessionError::PlayerOutOfRange);
        }
        Ok(player_id - 1)
    }

    fn add_spectator(&mut self, addr: SocketAddr) -> Result<PlayerHandle> {
        if self.spectators.len() >= MAX_SPECTATORS {
            return Err(SessionError::TooManySpectators);
        }
        // Spectators join before the game starts; attaching mid-game would
        // need a state transfer the wire protocol does not carry.
        if !self.synchronizing {
            return Err(SessionError::InvalidRequest);
        }
        let mut endpoint = PeerProtocol::with_logger(
            addr,
            self.input_size * self.num_players,
            self.log.clone(),
        );
        endpoint.set_disconnect_timeout(self.disconnect_timeout);
        endpoint.set_disconnect_notify_start(self.disconnect_notify_start);
        endpoint.synchronize(self.now(), &self.transport);
        self.spectators.push(endpoint);
        Ok(PlayerHandle(
            self.spectators.len() - 1 + SPECTATOR_HANDLE_BASE,
        ))
    }

    /// Submit the local player's input for the current frame and broadcast
    /// it to every peer.
    pub fn add_local_input(
        &mut self,
        player: PlayerHandle,
        input: &[u8],
        handler: &mut dyn SessionHandler,
    ) -> Result<()> {
        if self.sync.in_rollback() {
            return Err(SessionError::InRollback);
        }
        if self.synchronizing {
            return Err(SessionError::NotSynchronized);
        }
        let queue = self.handle_to_queue(player)?;
        debug_assert_eq!(input.len(), self.input_size);

        let game_input = GameInput::new(Frame::NULL, input);
        let frame = self.sync.add_local_input(queue, game_input, handler)?;

        // A null frame means the input was swallowed by a frame-delay
        // decrease; nothing to record or send.
        if !frame.is_null() {
            self.local_connect_status.set_last_frame(queue, frame);
            let outgoing = GameInput::new(frame, input);
            let now = self.now();
            for endpoint in self.endpoints.iter_mut().flatten() {
                endpoint.send_input(outgoing, now, &self.local_connect_status, &self.transport);
            }
        }
        Ok(())
    }

    /// Resolve all players' inputs for the current frame into `output`
    /// (`input_size` bytes per player in seat order). The returned bitmask
    /// flags disconnected players, whose bytes are zeroed.
    pub fn synchronize_input(&mut self, output: &mut [u8]) -> Result<u32> {
        if self.synchronizing {
            return Err(SessionError::NotSynchronized);
        }
        Ok(self
            .sync
            .synchronize_inputs(output, &self.local_connect_status))
    }

    /// The host finished simulating the current frame.
    pub fn advance_frame(&mut self, handler: &mut dyn SessionHandler) {
        self.sync.increment_frame(handler);
        self.idle(handler);
    }

    /// Pump the network: drain inbound packets, run protocol timers,
    /// deliver events, roll back if needed, and advance the confirmed
    /// frontier. Call at least once per frame, ideally whenever the game
    /// loop has time to spare.
    ///
    /// Returns as soon as the inbox is empty. There is no time budget to
    /// pass: the transport is drained non-blockingly, never waited on, so
    /// a call costs at most one rollback replay.
    pub fn idle(&mut self, handler: &mut dyn SessionHandler) {
        let now = self.now();

        self.receive_all(now);
        for endpoint in self.endpoints.iter_mut().flatten() {
            endpoint.poll(now, &self.local_connect_status, &self.transport);
        }
        for spectator in &mut self.spectators {
            spectator.poll(now, &self.local_connect_status, &self.transport);
        }
        self.poll_protocol_events(handler, now);
        self.check_initial_sync(handler);

        if self.synchronizing {
            return;
        }

        self.sync
            .check_simulation(handler, &self.local_connect_status);

        // Keep the endpoints' fairness estimates current.
        let current_frame = self.sync.frame_count();
        for endpoint in self.endpoints.iter_mut().flatten() {
            endpoint.set_local_frame_number(current_frame);
        }

        let total_min = self.poll_confirmed_frames(handler, now);
        if total_min.0 >= 0 && total_min.0 != i32::MAX {
            if !self.spectators.is_empty() {
                self.feed_spectators(total_min, now);
            }
            self.sync.set_last_confirmed_frame(total_min);
        }

        if current_frame.0 > self.next_recommended_sleep {
            let mut interval = 0;
            for endpoint in self.endpoints.iter().flatten() {
                interval = cmp::max(interval, endpoint.recommend_frame_delay());
            }
            if interval > 0 {
                handler.on_event(SessionEvent::TimeSync {
                    frames_ahead: interval as u32,
                });
                self.next_recommended_sleep = current_frame.0 + RECOMMENDATION_INTERVAL;
            }
        }
    }

    fn receive_all(&mut self, now: u64) {
        loop {
            match self.transport.recv_from() {
                Ok(Some((data, from))) => match Message::decode(&data) {
                    Ok(msg) => self.route_message(&msg, from, now),
                    Err(err) => tracing::warn!(%from, %err, "dropping malformed packet"),
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "transport receive failed");
                    break;
                }
            }
        }
    }

    fn route_message(&mut self, msg: &Message, from: SocketAddr, now: u64) {
        for endpoint in self.endpoints.iter_mut().flatten() {
            if endpoint.handles_addr(from) {
                endpoint.on_message(msg, now, &self.transport);
                return;
            }
        }
        for spectator in &mut self.spectators {
            if spectator.handles_addr(from) {
                spectator.on_message(msg, now, &self.transport);
                return;
            }
        }
        tracing::debug!(%from, "ignoring packet from unknown peer");
    }

    fn poll_protocol_events(&mut self, handler: &mut dyn SessionHandler, now: u64) {
        for queue in 0..self.num_players {
            loop {
                let event = match self.endpoints[queue].as_mut() {
                    Some(endpoint) => endpoint.poll_event(),
                    None => None,
                };
                match event {
                    Some(event) => self.on_peer_event(queue, event, handler, now),
                    None => break,
                }
            }
        }
        for i in 0..self.spectators.len() {
            while let Some(event) = self.spectators[i].poll_event() {
                self.on_spectator_event(i, event, handler, now);
            }
        }
    }

    fn on_peer_event(
        &mut self,
        queue: usize,
        event: ProtocolEvent,
        handler: &mut dyn SessionHandler,
        now: u64,
    ) {
        let player = Self::queue_to_handle(queue);
        match event {
            ProtocolEvent::Connected => handler.on_event(SessionEvent::Connected { player }),
            ProtocolEvent::Synchronizing { total, count } => {
                handler.on_event(SessionEvent::Synchronizing {
                    player,
                    count,
                    total,
                });
            }
            ProtocolEvent::Synchronized => {
                handler.on_event(SessionEvent::Synchronized { player });
                self.check_initial_sync(handler);
            }
            ProtocolEvent::Input(input) => {
                if !self.local_connect_status.get(queue).disconnected {
                    let current = self.local_connect_status.get(queue).last_frame;
                    debug_assert!(current.is_null() || input.frame == current.next());
                    self.sync.add_remote_input(queue, input);
                    self.local_connect_status.set_last_frame(queue, input.frame);
                }
            }
            ProtocolEvent::Disconnected => {
                if !self.local_connect_status.get(queue).disconnected {
                    let sync_to = self.local_connect_status.get(queue).last_frame;
                    self.disconnect_player_queue(queue, sync_to, handler, now);
                }
            }
            ProtocolEvent::NetworkInterrupted { disconnect_timeout } => {
                handler.on_event(SessionEvent::ConnectionInterrupted {
                    player,
                    disconnect_timeout,
                });
            }
            ProtocolEvent::NetworkResumed => {
                handler.on_event(SessionEvent::ConnectionResumed { player });
            }
        }
    }

    fn on_spectator_event(
        &mut self,
        index: usize,
        event: ProtocolEvent,
        handler: &mut dyn SessionHandler,
        now: u64,
    ) {
        let player = PlayerHandle(index + SPECTATOR_HANDLE_BASE);
        match event {
            ProtocolEvent::Connected => handler.on_event(SessionEvent::Connected { player }),
            ProtocolEvent::Synchronizing { total, count } => {
                handler.on_event(SessionEvent::Synchronizing {
                    player,
                    count,
                    total,
                });
            }
            ProtocolEvent::Synchronized => {
                handler.on_event(SessionEvent::Synchronized { player });
                self.check_initial_sync(handler);
            }
            ProtocolEvent::Disconnected => {
                self.spectators[index].disconnect(now);
                handler.on_event(SessionEvent::Disconnected { player });
            }
            // Spectators send no inputs and their link quality does not
            // affect the match.
            ProtocolEvent::Input(_)
            | ProtocolEvent::NetworkInterrupted { .. }
            | ProtocolEvent::NetworkResumed => {}
        }
    }

    /// The highest frame confirmed by every connected participant. Also
    /// where remotely-observed disconnects are folded in: if any peer saw a
    /// player drop, we drop them locally at the same frame so every
    /// machine resimulates identically.
    fn poll_confirmed_frames(&mut self, handler: &mut dyn SessionHandler, now: u64) -> Frame {
        let mut total_min = Frame(i32::MAX);
        for queue in 0..self.num_players {
            let mut queue_connected = true;
            let mut queue_min = Frame(i32::MAX);
            for endpoint in self.endpoints.iter().flatten() {
                if endpoint.is_running() {
                    let status = endpoint.peer_connect_status(queue);
                    queue_connected &= !status.disconnected;
                    queue_min = cmp::min(queue_min, status.last_frame);
                }
            }
            let local = self.local_connect_status.get(queue);
            if !local.disconnected {
                queue_min = cmp::min(queue_min, local.last_frame);
            }

            if queue_connected {
                total_min = cmp::min(total_min, queue_min);
            } else if !local.disconnected || local.last_frame > queue_min {
                self.log.line(&format!(
                    "session | disconnecting queue {queue} by remote request at frame {queue_min}"
                ));
                self.disconnect_player_queue(queue, queue_min, handler, now);
            }
        }
        total_min
    }

    fn feed_spectators(&mut self, up_to: Frame, now: u64) {
        let total_size = self.num_players * self.input_size;
        let mut buf = vec![0u8; total_size];
        while self.next_spectator_frame <= up_to {
            self.sync
                .confirmed_inputs(self.next_spectator_frame, &mut buf, &self.local_connect_status);
            let input = GameInput::new(self.next_spectator_frame, &buf);
            for spectator in &mut self.spectators {
                spectator.send_input(input, now, &self.local_connect_status, &self.transport);
            }
            self.next_spectator_frame = self.next_spectator_frame.next();
        }
    }

    /// Drop a player from the session. Disconnecting the local player
    /// disconnects every remote peer instead, freezing them all at the
    /// current frame.
    pub fn disconnect_player(
        &mut self,
        player: PlayerHandle,
        handler: &mut dyn SessionHandler,
    ) -> Result<()> {
        let queue = self.handle_to_queue(player)?;
        if self.local_connect_status.get(queue).disconnected {
            return Err(SessionError::PlayerDisconnected);
        }
        let now = self.now();
        if self.endpoints[queue].is_none() {
            let current_frame = self.sync.frame_count();
            for i in 0..self.num_players {
                if self.endpoints[i].is_some() && !self.local_connect_status.get(i).disconnected {
                    self.disconnect_player_queue(i, current_frame, handler, now);
                }
            }
        } else {
            let sync_to = self.local_connect_status.get(queue).last_frame;
            self.disconnect_player_queue(queue, sync_to, handler, now);
        }
        Ok(())
    }

    fn disconnect_player_queue(
        &mut self,
        queue: usize,
        sync_to: Frame,
        handler: &mut dyn SessionHandler,
        now: u64,
    ) {
        let frame_count = self.sync.frame_count();
        if let Some(endpoint) = self.endpoints[queue].as_mut() {
            endpoint.disconnect(now);
        }
        self.log.line(&format!(
            "session | disconnecting queue {queue} at frame {sync_to} (current frame {frame_count})"
        ));
        self.local_connect_status.set_disconnected(queue, sync_to);

        // Frames after the disconnect point were simulated with inputs the
        // player never actually gave; resimulate them with zeroed input.
        if sync_to < frame_count {
            self.sync
                .adjust_simulation(sync_to, handler, &self.local_connect_status);
        }

        handler.on_event(SessionEvent::Disconnected {
            player: Self::queue_to_handle(queue),
        });
        self.check_initial_sync(handler);
    }

    fn check_initial_sync(&mut self, handler: &mut dyn SessionHandler) {
        if !self.synchronizing {
            return;
        }
        for queue in 0..self.num_players {
            if let Some(endpoint) = &self.endpoints[queue] {
                if !self.local_connect_status.get(queue).disconnected
                    && !endpoint.is_synchronized()
                {
                    return;
                }
            }
        }
        for spectator in &self.spectators {
            if !spectator.is_synchronized() {
                return;
            }
        }
        handler.on_event(SessionEvent::Running);
        self.synchronizing = false;
    }

    pub fn network_stats(&self, player: PlayerHandle) -> Result<NetworkStats> {
        let queue = self.handle_to_queue(player)?;
        self.endpoints[queue]
            .as_ref()
            .map(|endpoint| endpoint.network_stats())
            .ok_or(SessionError::InvalidRequest)
    }

    /// Delay the given local player's inputs by `delay` frames, trading
    /// latency for prediction accuracy.
    pub fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<()> {
        let queue = self.handle_to_queue(player)?;
        self.sync.set_frame_delay(queue, delay);
        Ok(())
    }

    pub fn set_disconnect_timeout(&mut self, timeout_ms: u64) {
        self.disconnect_timeout = timeout_ms;
        for endpoint in self.endpoints.iter_mut().flatten() {
            endpoint.set_disconnect_timeout(timeout_ms);
        }
    }

    pub fn set_disconnect_notify_start(&mut self, notify_ms: u64) {
        self.disconnect_notify_start = notify_ms;
        for endpoint in self.endpoints.iter_mut().flatten() {
            endpoint.set_disconnect_notify_start(notify_ms);
        }
    }
}
