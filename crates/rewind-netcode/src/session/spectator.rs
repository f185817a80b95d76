//! Spectator session backend
//!
//! A spectator keeps one protocol endpoint to the host and receives the
//! fully confirmed input stream for every player, packed into a single
//! combined input per frame. It never predicts and never rolls back: if a
//! frame's inputs have not arrived yet the spectator simply waits.

use crate::connect_status::ConnectStatusTable;
use crate::event::ProtocolEvent;
use crate::handler::{PlayerHandle, SessionEvent, SessionHandler};
use crate::message::Message;
use crate::protocol::PeerProtocol;
use crate::transport::Transport;
use crate::{Result, SessionError};
use rewind_core::{Frame, GameInput, Logger, NullLog};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Frames of confirmed input buffered ahead of playback. If the host gets
/// further ahead than this, the stream is unrecoverable.
const SPECTATOR_FRAME_BUFFER: usize = 64;

/// Events about the host connection are reported under this handle.
const HOST_HANDLE: PlayerHandle = PlayerHandle(0);

pub struct SpectatorSession<T: Transport> {
    transport: T,
    host: PeerProtocol,

    num_players: usize,
    input_size: usize,

    synchronizing: bool,
    inputs: Vec<GameInput>,
    next_input_to_send: Frame,

    // Spectators carry no player statuses; the endpoint still wants a
    // table to embed in (empty) outbound input packets.
    local_connect_status: ConnectStatusTable,

    start: Instant,
}

impl<T: Transport> SpectatorSession<T> {
    pub fn new(transport: T, num_players: usize, input_size: usize, host_addr: SocketAddr) -> Self {
        Self::with_logger(transport, num_players, input_size, host_addr, Arc::new(NullLog))
    }

    pub fn with_logger(
        transport: T,
        num_players: usize,
        input_size: usize,
        host_addr: SocketAddr,
        log: Logger,
    ) -> Self {
        let total_size = num_players * input_size;
        let mut host = PeerProtocol::with_logger(host_addr, total_size, log);
        host.synchronize(0, &transport);
        Self {
            transport,
            host,
            num_players,
            input_size,
            synchronizing: true,
            inputs: vec![GameInput::null(total_size); SPECTATOR_FRAME_BUFFER],
            next_input_to_send: Frame::ZERO,
            local_connect_status: ConnectStatusTable::new(),
            start: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Pump the connection to the host: drain packets, run timers, ack
    /// received frames, and surface lifecycle events.
    pub fn idle(&mut self, handler: &mut dyn SessionHandler) {
        let now = self.now();

        loop {
            match self.transport.recv_from() {
                Ok(Some((data, from))) => {
                    if !self.host.handles_addr(from) {
                        tracing::debug!(%from, "ignoring packet from unknown peer");
                        continue;
                    }
                    match Message::decode(&data) {
                        Ok(msg) => self.host.on_message(&msg, now, &self.transport),
                        Err(err) => tracing::warn!(%from, %err, "dropping malformed packet"),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "transport receive failed");
                    break;
                }
            }
        }

        self.host
            .poll(now, &self.local_connect_status, &self.transport);

        while let Some(event) = self.host.poll_event() {
            self.on_host_event(event, handler, now);
        }
    }

    fn on_host_event(&mut self, event: ProtocolEvent, handler: &mut dyn SessionHandler, now: u64) {
        match event {
            ProtocolEvent::Connected => {
                handler.on_event(SessionEvent::Connected {
                    player: HOST_HANDLE,
                });
            }
            ProtocolEvent::Synchronizing { total, count } => {
                handler.on_event(SessionEvent::Synchronizing {
                    player: HOST_HANDLE,
                    count,
                    total,
                });
            }
            ProtocolEvent::Synchronized => {
                if self.synchronizing {
                    handler.on_event(SessionEvent::Synchronized {
                        player: HOST_HANDLE,
                    });
                    handler.on_event(SessionEvent::Running);
                    self.synchronizing = false;
                }
            }
            ProtocolEvent::Input(input) => {
                self.inputs[input.frame.index(SPECTATOR_FRAME_BUFFER)] = input;
                self.host.set_local_frame_number(input.frame);
                self.host.send_input_ack(now, &self.transport);
            }
            ProtocolEvent::Disconnected => {
                handler.on_event(SessionEvent::Disconnected {
                    player: HOST_HANDLE,
                });
            }
            ProtocolEvent::NetworkInterrupted { disconnect_timeout } => {
                handler.on_event(SessionEvent::ConnectionInterrupted {
                    player: HOST_HANDLE,
                    disconnect_timeout,
                });
            }
            ProtocolEvent::NetworkResumed => {
                handler.on_event(SessionEvent::ConnectionResumed {
                    player: HOST_HANDLE,
                });
            }
        }
    }

    /// The confirmed inputs for the next playback frame, `input_size`
    /// bytes per player in seat order.
    ///
    /// `PredictionThreshold` means the host's stream has not reached this
    /// frame yet; idle and retry. `InputDropped` means playback fell more
    /// than the buffer length behind and the frame is gone for good.
    pub fn synchronize_input(&mut self, output: &mut [u8]) -> Result<u32> {
        if self.synchronizing {
            return Err(SessionError::NotSynchronized);
        }

        let input = self.inputs[self.next_input_to_send.index(SPECTATOR_FRAME_BUFFER)];
        if input.frame < self.next_input_to_send {
            return Err(SessionError::PredictionThreshold);
        }
        if input.frame > self.next_input_to_send {
            return Err(SessionError::InputDropped(self.next_input_to_send.0));
        }

        let total_size = self.num_players * self.input_size;
        debug_assert!(output.len() >= total_size);
        output[..total_size].copy_from_slice(input.data());
        self.next_input_to_send = self.next_input_to_send.next();
        Ok(0)
    }

    /// Playback finished a frame.
    pub fn advance_frame(&mut self, handler: &mut dyn SessionHandler) {
        self.idle(handler);
    }
}
