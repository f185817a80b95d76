//! Peer protocol endpoint
//!
//! One endpoint per remote peer. Owns the handshake state machine, the
//! delta-compressed input stream in both directions, sequence filtering,
//! quality reports for clock fairness, keepalives, and disconnect
//! detection. The endpoint never touches sockets directly; the session
//! passes the shared [`Transport`] into every call that may emit packets,
//! along with the current time in milliseconds, so the whole state machine
//! is deterministic under test.

use crate::connect_status::{ConnectStatus, ConnectStatusTable};
use crate::event::ProtocolEvent;
use crate::message::{InputMessage, Message, MessageBody};
use crate::time_sync::TimeSync;
use crate::transport::Transport;
use crate::MAX_PLAYERS;
use rewind_core::{bitvec, Frame, GameInput, Logger, NullLog, RingBuffer, MAX_COMPRESSED_BITS};
use std::cmp;
use std::net::SocketAddr;
use std::sync::Arc;

const NUM_SYNC_PACKETS: u32 = 5;
const SYNC_FIRST_RETRY_INTERVAL: u64 = 500;
const SYNC_RETRY_INTERVAL: u64 = 2000;
const RUNNING_RETRY_INTERVAL: u64 = 200;
const QUALITY_REPORT_INTERVAL: u64 = 1000;
const NETWORK_STATS_INTERVAL: u64 = 1000;
const KEEP_ALIVE_INTERVAL: u64 = 200;
const SHUTDOWN_TIMER: u64 = 5000;

/// Sequence numbers this far ahead of the last accepted one are treated as
/// stale wraparound garbage and dropped.
const MAX_SEQ_DISTANCE: u16 = 1 << 15;

const PENDING_OUTPUT_LENGTH: usize = 64;
const EVENT_QUEUE_LENGTH: usize = 64;
const SEND_QUEUE_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Syncing,
    Running,
    Disconnected,
}

/// Endpoint traffic and fairness counters for the host's debug overlay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub ping: u64,
    pub kbps_sent: usize,
    pub local_frames_behind: i32,
    pub remote_frames_behind: i32,
    pub send_queue_len: usize,
}

struct QueuedDatagram {
    send_time: u64,
    data: Vec<u8>,
}

pub struct PeerProtocol {
    peer_addr: SocketAddr,
    magic: u16,
    remote_magic: u16,
    next_send_seq: u16,
    next_recv_seq: u16,

    state: State,
    sync_roundtrips_remaining: u32,
    sync_random: u32,
    last_sync_request_time: u64,
    connected: bool,

    pending_output: RingBuffer<GameInput>,
    last_received_input: GameInput,
    last_acked_input: GameInput,
    last_input_send_time: u64,

    peer_connect_status: [ConnectStatus; MAX_PLAYERS],

    time_sync: TimeSync,
    round_trip_time: u64,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,
    last_quality_report_time: u64,

    last_send_time: u64,
    last_recv_time: u64,

    disconnect_timeout: u64,
    disconnect_notify_start: u64,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,
    shutdown_time: u64,

    stats_start_time: u64,
    last_stats_time: u64,
    bytes_sent: usize,
    packets_sent: usize,
    kbps_sent: usize,

    event_queue: RingBuffer<ProtocolEvent>,

    // Fault-injection knobs for loss and reordering under test.
    send_latency_ms: u64,
    oop_percent: u32,
    send_queue: RingBuffer<QueuedDatagram>,
    oo_packet: Option<QueuedDatagram>,

    log: Logger,
}

impl PeerProtocol {
    pub fn new(peer_addr: SocketAddr, input_size: usize) -> Self {
        Self::with_logger(peer_addr, input_size, Arc::new(NullLog))
    }

    pub fn with_logger(peer_addr: SocketAddr, input_size: usize, log: Logger) -> Self {
        let magic = loop {
            let candidate = rand::random::<u16>();
            if candidate != 0 {
                break candidate;
            }
        };
        Self {
            peer_addr,
            magic,
            remote_magic: 0,
            next_send_seq: 0,
            next_recv_seq: 0,
            state: State::Syncing,
            sync_roundtrips_remaining: NUM_SYNC_PACKETS,
            sync_random: 0,
            last_sync_request_time: 0,
            connected: false,
            pending_output: RingBuffer::new(PENDING_OUTPUT_LENGTH),
            last_received_input: GameInput::null(input_size),
            last_acked_input: GameInput::null(input_size),
            last_input_send_time: 0,
            peer_connect_status: [ConnectStatus::default(); MAX_PLAYERS],
            time_sync: TimeSync::new(),
            round_trip_time: 0,
            local_frame_advantage: 0,
            remote_frame_advantage: 0,
            last_quality_report_time: 0,
            last_send_time: 0,
            last_recv_time: 0,
            disconnect_timeout: 0,
            disconnect_notify_start: 0,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,
            shutdown_time: 0,
            stats_start_time: 0,
            last_stats_time: 0,
            bytes_sent: 0,
            packets_sent: 0,
            kbps_sent: 0,
            event_queue: RingBuffer::new(EVENT_QUEUE_LENGTH),
            send_latency_ms: 0,
            oop_percent: 0,
            send_queue: RingBuffer::new(SEND_QUEUE_LENGTH),
            oo_packet: None,
            log,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn handles_addr(&self, addr: SocketAddr) -> bool {
        self.peer_addr == addr
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self.state, State::Running | State::Disconnected)
    }

    pub fn peer_connect_status(&self, id: usize) -> ConnectStatus {
        self.peer_connect_status[id]
    }

    pub fn set_disconnect_timeout(&mut self, timeout_ms: u64) {
        self.disconnect_timeout = timeout_ms;
    }

    pub fn set_disconnect_notify_start(&mut self, notify_ms: u64) {
        self.disconnect_notify_start = notify_ms;
    }

    /// Artificial outbound latency in ms, for soak testing.
    pub fn set_send_latency(&mut self, latency_ms: u64) {
        self.send_latency_ms = latency_ms;
    }

    /// Percentage of packets to deliver out of order, for soak testing.
    pub fn set_oop_percent(&mut self, percent: u32) {
        self.oop_percent = percent;
    }

    pub fn poll_event(&mut self) -> Option<ProtocolEvent> {
        self.event_queue.pop()
    }

    /// Begin the handshake with the remote peer.
    pub fn synchronize(&mut self, now: u64, transport: &dyn Transport) {
        self.state = State::Syncing;
        self.sync_roundtrips_remaining = NUM_SYNC_PACKETS;
        self.send_sync_request(now, transport);
    }

    /// Stop talking to this peer. Outbound input packets keep flowing for
    /// a short grace period with the disconnect flag set so the peer hears
    /// about it even under loss.
    pub fn disconnect(&mut self, now: u64) {
        self.state = State::Disconnected;
        self.shutdown_time = now + SHUTDOWN_TIMER;
    }

    /// True once the post-disconnect grace period has fully elapsed.
    pub fn is_shut_down(&self, now: u64) -> bool {
        self.state == State::Disconnected && self.shutdown_time != 0 && now >= self.shutdown_time
    }

    /// Record the local simulation frame so frame-advantage reports stay
    /// current. The remote is estimated at its last sent frame plus the
    /// frames in flight over half the round trip.
    pub fn set_local_frame_number(&mut self, local_frame: Frame) {
        let remote_frame =
            self.last_received_input.frame.0 + (self.round_trip_time * 60 / 1000) as i32;
        self.local_frame_advantage = remote_frame - local_frame.0;
    }

    pub fn recommend_frame_delay(&self) -> i32 {
        self.time_sync.recommend_frame_wait_duration(false)
    }

    pub fn network_stats(&self) -> NetworkStats {
        NetworkStats {
            ping: self.round_trip_time,
            kbps_sent: self.kbps_sent,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
            send_queue_len: self.pending_output.len(),
        }
    }

    /// Queue a local input for transmission and flush the pending window.
    pub fn send_input(
        &mut self,
        input: GameInput,
        now: u64,
        local_status: &ConnectStatusTable,
        transport: &dyn Transport,
    ) {
        if self.state == State::Running {
            // Track fairness measurements frame by frame.
            self.time_sync.advance_frame(
                input,
                self.local_frame_advantage,
                self.remote_frame_advantage,
            );

            // The window only drains as the peer acks. If it fills, the
            // peer has been unresponsive for longer than the disconnect
            // machinery should ever allow.
            self.pending_output
                .push(input)
                .expect("pending output window overflow: peer never acked");
        }
        self.send_pending_output(now, local_status, transport);
    }

    /// Ack received inputs without sending any of our own. Used by
    /// spectators, which have no input stream back to the host.
    pub fn send_input_ack(&mut self, now: u64, transport: &dyn Transport) {
        self.send_message(
            MessageBody::InputAck {
                ack_frame: self.last_received_input.frame,
            },
            now,
            transport,
        );
    }

    fn send_pending_output(
        &mut self,
        now: u64,
        local_status: &ConnectStatusTable,
        transport: &dyn Transport,
    ) {
        let mut msg = Box::<InputMessage>::default();
        let mut offset = 0usize;

        if let Some(front) = self.pending_output.front() {
            msg.start_frame = front.frame;
            msg.input_size = front.size as u8;

            // Delta-encode the whole unacked window against the last input
            // the peer confirmed.
            let mut last = self.last_acked_input;
            debug_assert!(last.frame.is_null() || last.frame.next() == msg.start_frame);

            for j in 0..self.pending_output.len() {
                let current = *self.pending_output.get(j).unwrap();
                if !current.bits_eq(&last) {
                    for i in 0..current.size * 8 {
                        if current.bit(i) != last.bit(i) {
                            bitvec::write_bit(&mut msg.bits, &mut offset, true);
                            bitvec::write_bit(&mut msg.bits, &mut offset, current.bit(i));
                            bitvec::write_nibblet(&mut msg.bits, &mut offset, i);
                        }
                    }
                }
                bitvec::write_bit(&mut msg.bits, &mut offset, false);
                last = current;
            }
        }

        assert!(offset < MAX_COMPRESSED_BITS);
        msg.num_bits = offset as u16;
        msg.ack_frame = self.last_received_input.frame;
        msg.disconnect_requested = self.state == State::Disconnected;
        msg.peer_connect_status = local_status.snapshot();

        self.last_input_send_time = now;
        self.send_message(MessageBody::Input(msg), now, transport);
    }

    fn send_sync_request(&mut self, now: u64, transport: &dyn Transport) {
        self.sync_random = rand::random::<u32>();
        self.last_sync_request_time = now;
        self.send_message(
            MessageBody::SyncRequest {
                random: self.sync_random,
            },
            now,
            transport,
        );
    }

    fn send_message(&mut self, body: MessageBody, now: u64, transport: &dyn Transport) {
        let msg = Message {
            magic: self.magic,
            sequence: self.next_send_seq,
            body,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);

        let data = msg.encode();
        self.packets_sent += 1;
        self.bytes_sent += data.len();
        self.last_send_time = now;
        if self.stats_start_time == 0 {
            self.stats_start_time = now;
        }

        if self.send_latency_ms == 0 && self.oop_percent == 0 {
            self.transmit(&data, transport);
            return;
        }

        // Fault injection path: hold packets back, and occasionally hold
        // one back much longer so it arrives out of order.
        if self.oop_percent > 0 && self.oo_packet.is_none() && rand_percent() < self.oop_percent {
            let delay = rand::random::<u64>() % (self.send_latency_ms * 10 + 1000);
            self.oo_packet = Some(QueuedDatagram {
                send_time: now + self.send_latency_ms + delay,
                data,
            });
            return;
        }

        let jitter = if self.send_latency_ms > 0 {
            rand::random::<u64>() % (self.send_latency_ms / 2 + 1)
        } else {
            0
        };
        if self
            .send_queue
            .push(QueuedDatagram {
                send_time: now + self.send_latency_ms + jitter,
                data,
            })
            .is_err()
        {
            // The fault injector is drowning itself. Drop, like a real
            // congested link would.
            self.log.line("proto | send queue full, dropping packet");
        }
    }

    fn transmit(&self, data: &[u8], transport: &dyn Transport) {
        if let Err(err) = transport.send_to(data, self.peer_addr) {
            self.log
                .line(&format!("proto | send to {} failed: {err}", self.peer_addr));
        }
    }

    fn pump_send_queue(&mut self, now: u64, transport: &dyn Transport) {
        while let Some(front) = self.send_queue.front() {
            if front.send_time > now {
                break;
            }
            let pkt = self.send_queue.pop().unwrap();
            self.transmit(&pkt.data, transport);
        }
        if let Some(pkt) = &self.oo_packet {
            if pkt.send_time <= now {
                let pkt = self.oo_packet.take().unwrap();
                self.transmit(&pkt.data, transport);
            }
        }
    }

    /// Drive timers: handshake retries, input resends, quality reports,
    /// keepalives, and disconnect detection.
    pub fn poll(
        &mut self,
        now: u64,
        local_status: &ConnectStatusTable,
        transport: &dyn Transport,
    ) {
        match self.state {
            State::Syncing => {
                let interval = if self.sync_roundtrips_remaining == NUM_SYNC_PACKETS {
                    SYNC_FIRST_RETRY_INTERVAL
                } else {
                    SYNC_RETRY_INTERVAL
                };
                if self.last_sync_request_time + interval < now {
                    self.log.line(&format!(
                        "proto {} | no luck syncing after {interval} ms, re-queueing sync packet",
                        self.peer_addr
                    ));
                    self.send_sync_request(now, transport);
                }
            }
            State::Running => {
                if !self.pending_output.is_empty()
                    && self.last_input_send_time + RUNNING_RETRY_INTERVAL < now
                {
                    self.send_pending_output(now, local_status, transport);
                }

                if self.last_quality_report_time + QUALITY_REPORT_INTERVAL < now {
                    self.last_quality_report_time = now;
                    self.send_message(
                        MessageBody::QualityReport {
                            frame_advantage: self.local_frame_advantage as i8,
                            ping: now,
                        },
                        now,
                        transport,
                    );
                }

                if self.last_stats_time + NETWORK_STATS_INTERVAL < now {
                    self.update_network_stats(now);
                }

                if self.last_send_time + KEEP_ALIVE_INTERVAL < now {
                    self.send_message(MessageBody::KeepAlive, now, transport);
                }

                if self.disconnect_timeout > 0
                    && self.disconnect_notify_start > 0
                    && !self.disconnect_notify_sent
                    && self.last_recv_time + self.disconnect_notify_start < now
                {
                    self.log.line(&format!(
                        "proto {} | endpoint has stopped receiving packets for {} ms, sending notification",
                        self.peer_addr, self.disconnect_notify_start
                    ));
                    let remaining = self.disconnect_timeout - self.disconnect_notify_start;
                    self.queue_event(ProtocolEvent::NetworkInterrupted {
                        disconnect_timeout: remaining,
                    });
                    self.disconnect_notify_sent = true;
                }

                if self.disconnect_timeout > 0
                    && !self.disconnect_event_sent
                    && self.last_recv_time + self.disconnect_timeout < now
                {
                    self.log.line(&format!(
                        "proto {} | endpoint has stopped receiving packets for {} ms, disconnecting",
                        self.peer_addr, self.disconnect_timeout
                    ));
                    self.queue_event(ProtocolEvent::Disconnected);
                    self.disconnect_event_sent = true;
                }
            }
            State::Disconnected => {}
        }

        self.pump_send_queue(now, transport);
    }

    fn update_network_stats(&mut self, now: u64) {
        let elapsed_secs = (now - self.stats_start_time) as f64 / 1000.0;
        if elapsed_secs > 0.0 {
            self.kbps_sent = (self.bytes_sent as f64 / 1024.0 / elapsed_secs) as usize;
        }
        self.last_stats_time = now;
        self.log.line(&format!(
            "proto {} | network stats: {} kbps, {} packets sent, ping {} ms",
            self.peer_addr, self.kbps_sent, self.packets_sent, self.round_trip_time
        ));
    }

    /// Process one inbound datagram from this peer.
    pub fn on_message(&mut self, msg: &Message, now: u64, transport: &dyn Transport) {
        // Filter out packets that aren't from our peer's current session.
        // Handshake packets are exempt because the peer's magic is only
        // learned through them.
        if !msg.is_handshake() && msg.magic != self.remote_magic {
            self.log.line(&format!(
                "proto {} | recv rejecting message with bad magic {:04x}",
                self.peer_addr, msg.magic
            ));
            return;
        }

        // Drop severely out-of-order packets.
        let skipped = msg.sequence.wrapping_sub(self.next_recv_seq);
        if skipped > MAX_SEQ_DISTANCE {
            self.log.line(&format!(
                "proto {} | dropping out of order packet (seq: {}, last seq: {})",
                self.peer_addr, msg.sequence, self.next_recv_seq
            ));
            return;
        }
        self.next_recv_seq = msg.sequence;

        let handled = match &msg.body {
            MessageBody::SyncRequest { random } => {
                self.on_sync_request(msg.magic, *random, now, transport)
            }
            MessageBody::SyncReply { random } => {
                self.on_sync_reply(msg.magic, *random, now, transport)
            }
            MessageBody::Input(input) => self.on_input(input, now, transport),
            MessageBody::QualityReport {
                frame_advantage,
                ping,
            } => self.on_quality_report(*frame_advantage, *ping, now, transport),
            MessageBody::QualityReply { pong } => self.on_quality_reply(*pong, now),
            MessageBody::KeepAlive => true,
            MessageBody::InputAck { ack_frame } => self.on_input_ack(*ack_frame),
        };

        if handled {
            self.last_recv_time = now;
            if self.disconnect_notify_sent && self.state == State::Running {
                self.queue_event(ProtocolEvent::NetworkResumed);
                self.disconnect_notify_sent = false;
            }
        }
    }

    fn on_sync_request(
        &mut self,
        msg_magic: u16,
        random: u32,
        now: u64,
        transport: &dyn Transport,
    ) -> bool {
        // Once the peer's magic is known, a sync request carrying a
        // different one is some other session's probe.
        if self.remote_magic != 0 && msg_magic != self.remote_magic {
            self.log.line(&format!(
                "proto {} | ignoring sync request with bad magic {msg_magic:04x} (expected {:04x})",
                self.peer_addr, self.remote_magic
            ));
            return false;
        }
        self.send_message(MessageBody::SyncReply { random }, now, transport);
        true
    }

    fn on_sync_reply(
        &mut self,
        msg_magic: u16,
        random: u32,
        now: u64,
        transport: &dyn Transport,
    ) -> bool {
        if self.state != State::Syncing {
            self.log.line(&format!(
                "proto {} | ignoring SyncReply while not syncing",
                self.peer_addr
            ));
            // Still counts as traffic from a live peer.
            return msg_magic == self.remote_magic;
        }
        if random != self.sync_random {
            self.log.line(&format!(
                "proto {} | sync reply {random:08x} != {:08x}, keeping alive",
                self.peer_addr, self.sync_random
            ));
            return false;
        }

        if !self.connected {
            self.queue_event(ProtocolEvent::Connected);
            self.connected = true;
        }

        self.sync_roundtrips_remaining -= 1;
        if self.sync_roundtrips_remaining == 0 {
            self.log
                .line(&format!("proto {} | synchronized", self.peer_addr));
            self.queue_event(ProtocolEvent::Synchronized);
            self.state = State::Running;
            self.last_received_input.frame = Frame::NULL;
            self.remote_magic = msg_magic;
        } else {
            self.queue_event(ProtocolEvent::Synchronizing {
                total: NUM_SYNC_PACKETS,
                count: NUM_SYNC_PACKETS - self.sync_roundtrips_remaining,
            });
            self.send_sync_request(now, transport);
        }
        true
    }

    fn on_input(&mut self, msg: &InputMessage, now: u64, _transport: &dyn Transport) -> bool {
        // A peer that requested disconnect stops being a source of inputs
        // entirely.
        if msg.disconnect_requested {
            if self.state != State::Disconnected && !self.disconnect_event_sent {
                self.log
                    .line(&format!("proto {} | disconnecting endpoint on remote request", self.peer_addr));
                self.queue_event(ProtocolEvent::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            // Merge the peer's view of everyone's status into ours. The
            // most complete revision wins field by field.
            for (ours, theirs) in self
                .peer_connect_status
                .iter_mut()
                .zip(msg.peer_connect_status.iter())
            {
                debug_assert!(theirs.last_frame >= ours.last_frame);
                ours.disconnected = ours.disconnected || theirs.disconnected;
                ours.last_frame = cmp::max(ours.last_frame, theirs.last_frame);
            }
        }

        // Decompress the input window. Frames at or below our watermark
        // were already delivered; their deltas are baked into the running
        // accumulator, so they are skipped without applying anything.
        let mut current_frame = msg.start_frame;
        let num_bits = usize::from(msg.num_bits);
        if num_bits > 0 && self.last_received_input.frame.is_null() {
            self.last_received_input.frame = msg.start_frame.prev();
        }

        let mut offset = 0usize;
        while offset < num_bits {
            debug_assert!(current_frame <= self.last_received_input.frame.next());
            let use_inputs = current_frame == self.last_received_input.frame.next();

            while bitvec::read_bit(&msg.bits, &mut offset) {
                let on = bitvec::read_bit(&msg.bits, &mut offset);
                let button = bitvec::read_nibblet(&msg.bits, &mut offset);
                // A corrupted packet can name any 8-bit index; only the
                // input buffer's bits are addressable.
                if button >= self.last_received_input.size * 8 {
                    self.log.line(&format!(
                        "proto {} | dropping input packet with out of range bit index {button}",
                        self.peer_addr
                    ));
                    return false;
                }
                if use_inputs {
                    if on {
                        self.last_received_input.set_bit(button);
                    } else {
                        self.last_received_input.clear_bit(button);
                    }
                }
            }
            debug_assert!(offset <= num_bits);

            if use_inputs {
                debug_assert_eq!(current_frame, self.last_received_input.frame.next());
                self.last_received_input.frame = current_frame;
                self.log.line(&format!(
                    "proto {} | received input {}",
                    self.peer_addr, self.last_received_input
                ));
                self.queue_event(ProtocolEvent::Input(self.last_received_input));
            } else {
                self.log.line(&format!(
                    "proto {} | skipping past frame {current_frame} (current: {})",
                    self.peer_addr, self.last_received_input.frame
                ));
            }
            current_frame = current_frame.next();
        }

        debug_assert!(self.last_received_input.frame >= msg.start_frame.prev());

        self.drain_acked(msg.ack_frame);
        true
    }

    fn on_input_ack(&mut self, ack_frame: Frame) -> bool {
        self.drain_acked(ack_frame);
        true
    }

    /// Pop everything the peer has acknowledged out of the pending window,
    /// remembering the newest acked input as the next delta base.
    fn drain_acked(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending_output.front() {
            if front.frame >= ack_frame {
                break;
            }
            let acked = self.pending_output.pop().unwrap();
            self.log.line(&format!(
                "proto {} | throwing away pending output frame {}",
                self.peer_addr, acked.frame
            ));
            self.last_acked_input = acked;
        }
    }

    fn on_quality_report(
        &mut self,
        frame_advantage: i8,
        ping: u64,
        now: u64,
        transport: &dyn Transport,
    ) -> bool {
        self.remote_frame_advantage = i32::from(frame_advantage);
        self.send_message(MessageBody::QualityReply { pong: ping }, now, transport);
        true
    }

    fn on_quality_reply(&mut self, pong: u64, now: u64) -> bool {
        self.round_trip_time = now.saturating_sub(pong);
        true
    }

    fn queue_event(&mut self, event: ProtocolEvent) {
        if self.event_queue.push(event).is_err() {
            // The session stopped draining events; nothing sane to do but
            // drop. The session polls every tick, so this is a host bug.
            self.log.line("proto | event queue full, dropping event");
        }
    }
}

fn rand_percent() -> u32 {
    rand::random::<u32>() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{pair, LoopbackEnd};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn endpoints() -> (PeerProtocol, PeerProtocol, LoopbackEnd, LoopbackEnd) {
        let (ta, tb) = pair(addr(7000), addr(7001));
        let a = PeerProtocol::new(addr(7001), 1);
        let b = PeerProtocol::new(addr(7000), 1);
        (a, b, ta, tb)
    }

    /// Deliver every queued datagram in both directions until the link is
    /// quiet.
    fn pump(
        a: &mut PeerProtocol,
        b: &mut PeerProtocol,
        ta: &LoopbackEnd,
        tb: &LoopbackEnd,
        now: u64,
    ) {
        loop {
            let mut progressed = false;
            while let Some((data, _)) = ta.recv_from().unwrap() {
                a.on_message(&Message::decode(&data).unwrap(), now, ta);
                progressed = true;
            }
            while let Some((data, _)) = tb.recv_from().unwrap() {
                b.on_message(&Message::decode(&data).unwrap(), now, tb);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn drain(p: &mut PeerProtocol) -> Vec<ProtocolEvent> {
        std::iter::from_fn(|| p.poll_event()).collect()
    }

    fn synchronize_both(
        a: &mut PeerProtocol,
        b: &mut PeerProtocol,
        ta: &LoopbackEnd,
        tb: &LoopbackEnd,
    ) {
        a.synchronize(0, ta);
        b.synchronize(0, tb);
        pump(a, b, ta, tb, 0);
        drain(a);
        drain(b);
    }

    #[test]
    fn test_handshake_completes_both_sides() {
        let (mut a, mut b, ta, tb) = endpoints();
        a.synchronize(0, &ta);
        b.synchronize(0, &tb);
        pump(&mut a, &mut b, &ta, &tb, 0);

        assert!(a.is_running());
        assert!(b.is_running());

        let events = drain(&mut a);
        assert_eq!(events[0], ProtocolEvent::Connected);
        let sync_count = events
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::Synchronizing { .. }))
            .count();
        assert_eq!(sync_count, NUM_SYNC_PACKETS as usize - 1);
        let done: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::Synchronized))
            .collect();
        assert_eq!(done.len(), 1);
        assert_eq!(events.last(), Some(&ProtocolEvent::Synchronized));
    }

    #[test]
    fn test_sync_request_retried_on_timeout() {
        let (mut a, _b, ta, tb) = endpoints();
        a.synchronize(0, &ta);
        while tb.recv_from().unwrap().is_some() {}

        // Nothing happens before the first retry interval.
        let table = ConnectStatusTable::new();
        a.poll(SYNC_FIRST_RETRY_INTERVAL, &table, &ta);
        assert!(tb.recv_from().unwrap().is_none());

        a.poll(SYNC_FIRST_RETRY_INTERVAL + 1, &table, &ta);
        let (data, _) = tb.recv_from().unwrap().unwrap();
        let msg = Message::decode(&data).unwrap();
        assert!(matches!(msg.body, MessageBody::SyncRequest { .. }));
    }

    #[test]
    fn test_input_stream_delivers_in_order() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        for (f, byte) in [(0, 0x01u8), (1, 0x03), (2, 0x02)] {
            a.send_input(GameInput::new(Frame(f), &[byte]), 10, &table, &ta);
        }
        pump(&mut a, &mut b, &ta, &tb, 10);

        let inputs: Vec<GameInput> = drain(&mut b)
            .into_iter()
            .filter_map(|e| match e {
                ProtocolEvent::Input(input) => Some(input),
                _ => None,
            })
            .collect();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0], GameInput::new(Frame(0), &[0x01]));
        assert_eq!(inputs[1], GameInput::new(Frame(1), &[0x03]));
        assert_eq!(inputs[2], GameInput::new(Frame(2), &[0x02]));
    }

    #[test]
    fn test_redundant_window_ignores_duplicates() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        a.send_input(GameInput::new(Frame(0), &[0x01]), 10, &table, &ta);
        pump(&mut a, &mut b, &ta, &tb, 10);
        assert_eq!(drain(&mut b).len(), 1);

        // The unacked window resends frame 0 alongside frame 1; the peer
        // must deliver only the new frame.
        a.send_input(GameInput::new(Frame(1), &[0x02]), 20, &table, &ta);
        pump(&mut a, &mut b, &ta, &tb, 20);
        let events = drain(&mut b);
        assert_eq!(
            events,
            vec![ProtocolEvent::Input(GameInput::new(Frame(1), &[0x02]))]
        );
    }

    #[test]
    fn test_acks_drain_pending_window() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        for f in 0..5 {
            a.send_input(GameInput::new(Frame(f), &[f as u8]), 10, &table, &ta);
        }
        pump(&mut a, &mut b, &ta, &tb, 10);
        drain(&mut b);
        assert_eq!(a.network_stats().send_queue_len, 5);

        // The ack rides on the peer's own (empty) input packet.
        b.send_input_ack(20, &tb);
        pump(&mut a, &mut b, &ta, &tb, 20);
        // Everything below the acked frame drains; the acked frame itself
        // stays until a later ack passes it.
        assert_eq!(a.network_stats().send_queue_len, 1);
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        a.send_input(GameInput::new(Frame(0), &[0x01]), 10, &table, &ta);
        let (data, _) = tb.recv_from().unwrap().unwrap();
        let mut msg = Message::decode(&data).unwrap();
        b.on_message(&msg, 10, &tb);
        assert_eq!(drain(&mut b).len(), 1);

        // Replay the same packet with a sequence just behind the cursor;
        // the wrapped distance lands deep in the stale half of the space.
        msg.sequence = msg.sequence.wrapping_sub(5);
        b.on_message(&msg, 11, &tb);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_out_of_range_bit_index_dropped() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        a.send_input(GameInput::new(Frame(0), &[0x01]), 10, &table, &ta);
        let (data, _) = tb.recv_from().unwrap().unwrap();
        let mut msg = Message::decode(&data).unwrap();

        // Rewrite the delta block to flip a bit index far past the end of
        // the input buffer.
        match &mut msg.body {
            MessageBody::Input(input) => {
                let mut offset = 0usize;
                bitvec::write_bit(&mut input.bits, &mut offset, true);
                bitvec::write_bit(&mut input.bits, &mut offset, true);
                bitvec::write_nibblet(&mut input.bits, &mut offset, 200);
                bitvec::write_bit(&mut input.bits, &mut offset, false);
                input.num_bits = offset as u16;
            }
            other => panic!("expected an input message, got {other:?}"),
        }
        b.on_message(&msg, 10, &tb);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_empty_input_window_keeps_watermark() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        a.send_input(GameInput::new(Frame(0), &[0x01]), 10, &table, &ta);
        let (data, _) = tb.recv_from().unwrap().unwrap();
        let real = Message::decode(&data).unwrap();

        // An input packet with an empty window, as the disconnect grace
        // period sends when no input was ever queued.
        let mut empty = real.clone();
        if let MessageBody::Input(input) = &mut empty.body {
            input.start_frame = Frame::NULL;
            input.num_bits = 0;
        }
        b.on_message(&empty, 10, &tb);
        assert!(drain(&mut b).is_empty());

        // The genuine first input must still be delivered afterwards.
        b.on_message(&real, 11, &tb);
        assert_eq!(
            drain(&mut b),
            vec![ProtocolEvent::Input(GameInput::new(Frame(0), &[0x01]))]
        );
    }

    #[test]
    fn test_sync_request_from_unknown_magic_ignored() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        // Learn a's real magic off a captured packet.
        let table = ConnectStatusTable::new();
        a.send_input(GameInput::new(Frame(0), &[0x01]), 10, &table, &ta);
        let (data, _) = tb.recv_from().unwrap().unwrap();
        let real_magic = Message::decode(&data).unwrap().magic;
        b.on_message(&Message::decode(&data).unwrap(), 10, &tb);
        drain(&mut b);

        // A sync request claiming a different session must go unanswered.
        let spoofed = Message {
            magic: real_magic ^ 0xffff,
            sequence: 99,
            body: MessageBody::SyncRequest { random: 7 },
        };
        b.on_message(&spoofed, 20, &tb);
        assert!(ta.recv_from().unwrap().is_none());

        // The known peer restarting its handshake is still answered.
        let genuine = Message {
            magic: real_magic,
            sequence: 100,
            body: MessageBody::SyncRequest { random: 8 },
        };
        b.on_message(&genuine, 20, &tb);
        let (reply, _) = ta.recv_from().unwrap().unwrap();
        assert!(matches!(
            Message::decode(&reply).unwrap().body,
            MessageBody::SyncReply { random: 8 }
        ));
    }

    #[test]
    fn test_wrong_magic_dropped() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        a.send_input(GameInput::new(Frame(0), &[0x01]), 10, &table, &ta);
        let (data, _) = tb.recv_from().unwrap().unwrap();
        let mut msg = Message::decode(&data).unwrap();
        msg.magic ^= 0xffff;
        b.on_message(&msg, 10, &tb);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_quality_report_measures_rtt() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        // Quality report fires after its interval elapses.
        a.poll(QUALITY_REPORT_INTERVAL + 1, &table, &ta);
        // The peer replies 40 ms later; the reply arrives 80 ms after send.
        while let Some((data, _)) = tb.recv_from().unwrap() {
            b.on_message(
                &Message::decode(&data).unwrap(),
                QUALITY_REPORT_INTERVAL + 41,
                &tb,
            );
        }
        while let Some((data, _)) = ta.recv_from().unwrap() {
            a.on_message(
                &Message::decode(&data).unwrap(),
                QUALITY_REPORT_INTERVAL + 81,
                &ta,
            );
        }
        assert_eq!(a.network_stats().ping, 80);
    }

    #[test]
    fn test_disconnect_notify_then_timeout() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        a.set_disconnect_timeout(5000);
        a.set_disconnect_notify_start(750);

        let table = ConnectStatusTable::new();
        a.poll(751, &table, &ta);
        let events = drain(&mut a);
        assert!(events.contains(&ProtocolEvent::NetworkInterrupted {
            disconnect_timeout: 4250
        }));

        // Traffic resumes before the timeout: interruption is withdrawn.
        b.send_input_ack(800, &tb);
        pump(&mut a, &mut b, &ta, &tb, 800);
        assert!(drain(&mut a).contains(&ProtocolEvent::NetworkResumed));

        // Now go fully silent past the timeout.
        a.poll(800 + 5001, &table, &ta);
        assert!(drain(&mut a).contains(&ProtocolEvent::Disconnected));
    }

    #[test]
    fn test_remote_disconnect_request() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let table = ConnectStatusTable::new();
        b.disconnect(100);
        // The disconnect flag rides on the next input packet.
        b.send_input(GameInput::new(Frame(0), &[0x00]), 100, &table, &tb);
        pump(&mut a, &mut b, &ta, &tb, 100);
        assert!(drain(&mut a).contains(&ProtocolEvent::Disconnected));
    }

    #[test]
    fn test_connect_status_merge_takes_most_complete() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        let mut table = ConnectStatusTable::new();
        table.set_last_frame(0, Frame(12));
        table.set_disconnected(2, Frame(3));
        b.send_input(GameInput::new(Frame(0), &[0x00]), 10, &table, &tb);
        pump(&mut a, &mut b, &ta, &tb, 10);
        drain(&mut a);

        assert_eq!(a.peer_connect_status(0).last_frame, Frame(12));
        assert!(a.peer_connect_status(2).disconnected);
        assert_eq!(a.peer_connect_status(2).last_frame, Frame(3));
    }

    #[test]
    fn test_frame_advantage_estimate() {
        let (mut a, mut b, ta, tb) = endpoints();
        synchronize_both(&mut a, &mut b, &ta, &tb);

        // No inputs received yet and zero rtt: remote is estimated at -1.
        a.set_local_frame_number(Frame(9));
        assert_eq!(a.network_stats().local_frames_behind, -10);
    }
}
