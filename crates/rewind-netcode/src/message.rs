//! Wire message framing
//!
//! Every datagram is `magic:u16 | sequence:u16 | kind:u8 | payload`, all
//! multi-byte fields little-endian. The encoding is explicit rather than
//! derived: the layout is a compatibility contract and must not drift with
//! a serializer's defaults.

use crate::connect_status::ConnectStatus;
use crate::MAX_PLAYERS;
use rewind_core::{Frame, MAX_COMPRESSED_BITS};
use thiserror::Error;

const KIND_SYNC_REQUEST: u8 = 1;
const KIND_SYNC_REPLY: u8 = 2;
const KIND_INPUT: u8 = 3;
const KIND_QUALITY_REPORT: u8 = 4;
const KIND_QUALITY_REPLY: u8 = 5;
const KIND_KEEP_ALIVE: u8 = 6;
const KIND_INPUT_ACK: u8 = 7;

/// Malformed inbound datagram. The receiver logs and drops; a bad packet
/// from the network is never an application error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
}

/// Delta-compressed batch of local inputs plus the sender's view of every
/// player's connect status. Boxed inside [`MessageBody`] to keep the other
/// variants small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMessage {
    pub peer_connect_status: [ConnectStatus; MAX_PLAYERS],
    pub start_frame: Frame,
    pub disconnect_requested: bool,
    pub ack_frame: Frame,
    pub input_size: u8,
    pub num_bits: u16,
    pub bits: [u8; MAX_COMPRESSED_BITS / 8],
}

impl Default for InputMessage {
    fn default() -> Self {
        Self {
            peer_connect_status: [ConnectStatus::default(); MAX_PLAYERS],
            start_frame: Frame::NULL,
            disconnect_requested: false,
            ack_frame: Frame::NULL,
            input_size: 0,
            num_bits: 0,
            bits: [0u8; MAX_COMPRESSED_BITS / 8],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Handshake probe carrying a random nonce to echo.
    SyncRequest { random: u32 },
    /// Handshake answer echoing the probe's nonce.
    SyncReply { random: u32 },
    Input(Box<InputMessage>),
    /// Periodic report of our frame advantage; `ping` is the sender's
    /// clock, echoed back for RTT measurement.
    QualityReport { frame_advantage: i8, ping: u64 },
    QualityReply { pong: u64 },
    KeepAlive,
    /// Standalone input acknowledgement, sent when we have no input of our
    /// own to piggyback the ack on.
    InputAck { ack_frame: Frame },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub magic: u16,
    pub sequence: u16,
    pub body: MessageBody,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        match &self.body {
            MessageBody::SyncRequest { random } => {
                out.push(KIND_SYNC_REQUEST);
                out.extend_from_slice(&random.to_le_bytes());
            }
            MessageBody::SyncReply { random } => {
                out.push(KIND_SYNC_REPLY);
                out.extend_from_slice(&random.to_le_bytes());
            }
            MessageBody::Input(input) => {
                out.push(KIND_INPUT);
                for status in &input.peer_connect_status {
                    out.extend_from_slice(&status.pack().to_le_bytes());
                }
                out.extend_from_slice(&input.start_frame.0.to_le_bytes());
                out.push(u8::from(input.disconnect_requested));
                out.extend_from_slice(&input.ack_frame.0.to_le_bytes());
                out.push(input.input_size);
                out.extend_from_slice(&input.num_bits.to_le_bytes());
                let num_bytes = (usize::from(input.num_bits) + 7) / 8;
                out.extend_from_slice(&input.bits[..num_bytes]);
            }
            MessageBody::QualityReport {
                frame_advantage,
                ping,
            } => {
                out.push(KIND_QUALITY_REPORT);
                out.push(*frame_advantage as u8);
                out.extend_from_slice(&ping.to_le_bytes());
            }
            MessageBody::QualityReply { pong } => {
                out.push(KIND_QUALITY_REPLY);
                out.extend_from_slice(&pong.to_le_bytes());
            }
            MessageBody::KeepAlive => {
                out.push(KIND_KEEP_ALIVE);
            }
            MessageBody::InputAck { ack_frame } => {
                out.push(KIND_INPUT_ACK);
                out.extend_from_slice(&ack_frame.0.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let magic = r.u16()?;
        let sequence = r.u16()?;
        let kind = r.u8()?;
        let body = match kind {
            KIND_SYNC_REQUEST => MessageBody::SyncRequest { random: r.u32()? },
            KIND_SYNC_REPLY => MessageBody::SyncReply { random: r.u32()? },
            KIND_INPUT => {
                let mut input = Box::<InputMessage>::default();
                for status in &mut input.peer_connect_status {
                    *status = ConnectStatus::unpack(r.u32()?);
                }
                input.start_frame = Frame(r.i32()?);
                input.disconnect_requested = r.u8()? & 1 != 0;
                input.ack_frame = Frame(r.i32()?);
                input.input_size = r.u8()?;
                input.num_bits = r.u16()?;
                let num_bytes = (usize::from(input.num_bits) + 7) / 8;
                if num_bytes > input.bits.len() {
                    return Err(WireError::Truncated);
                }
                input.bits[..num_bytes].copy_from_slice(r.bytes(num_bytes)?);
                MessageBody::Input(input)
            }
            KIND_QUALITY_REPORT => MessageBody::QualityReport {
                frame_advantage: r.u8()? as i8,
                ping: r.u64()?,
            },
            KIND_QUALITY_REPLY => MessageBody::QualityReply { pong: r.u64()? },
            KIND_KEEP_ALIVE => MessageBody::KeepAlive,
            KIND_INPUT_ACK => MessageBody::InputAck {
                ack_frame: Frame(r.i32()?),
            },
            other => return Err(WireError::UnknownKind(other)),
        };
        Ok(Self {
            magic,
            sequence,
            body,
        })
    }

    /// Handshake packets are accepted before the peer's magic is known;
    /// everything else must carry it.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self.body,
            MessageBody::SyncRequest { .. } | MessageBody::SyncReply { .. }
        )
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        if end > self.data.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: MessageBody) {
        let msg = Message {
            magic: 0xbeef,
            sequence: 42,
            body,
        };
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_header_layout() {
        let msg = Message {
            magic: 0x1234,
            sequence: 0x5678,
            body: MessageBody::KeepAlive,
        };
        assert_eq!(msg.encode(), vec![0x34, 0x12, 0x78, 0x56, 6]);
    }

    #[test]
    fn test_sync_round_trips() {
        round_trip(MessageBody::SyncRequest { random: 0xdead_beef });
        round_trip(MessageBody::SyncReply { random: 0xdead_beef });
    }

    #[test]
    fn test_quality_round_trips() {
        round_trip(MessageBody::QualityReport {
            frame_advantage: -3,
            ping: 123_456,
        });
        round_trip(MessageBody::QualityReply { pong: 123_456 });
        round_trip(MessageBody::InputAck {
            ack_frame: Frame(99),
        });
    }

    #[test]
    fn test_input_round_trips() {
        let mut input = InputMessage {
            start_frame: Frame(10),
            disconnect_requested: true,
            ack_frame: Frame(8),
            input_size: 2,
            num_bits: 19,
            ..Default::default()
        };
        input.peer_connect_status[1] = ConnectStatus {
            disconnected: true,
            last_frame: Frame(7),
        };
        input.bits[0] = 0xa5;
        input.bits[1] = 0x5a;
        input.bits[2] = 0x04;
        round_trip(MessageBody::Input(Box::new(input)));
    }

    #[test]
    fn test_input_omits_trailing_bit_bytes() {
        let msg = Message {
            magic: 1,
            sequence: 1,
            body: MessageBody::Input(Box::new(InputMessage {
                num_bits: 8,
                ..Default::default()
            })),
        };
        // header 5 + statuses 16 + start_frame 4 + flags 1 + ack 4
        // + input_size 1 + num_bits 2 + one bit byte
        assert_eq!(msg.encode().len(), 34);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Message::decode(&[0, 0, 0, 0, 250]).unwrap_err();
        assert_eq!(err, WireError::UnknownKind(250));
    }

    #[test]
    fn test_truncated_rejected() {
        assert_eq!(Message::decode(&[0, 0, 0]), Err(WireError::Truncated));
        // SyncRequest with a short nonce.
        assert_eq!(
            Message::decode(&[0, 0, 0, 0, 1, 0xaa]),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn test_oversized_bit_count_rejected() {
        let mut msg = Message {
            magic: 1,
            sequence: 1,
            body: MessageBody::Input(Box::default()),
        }
        .encode();
        // Patch num_bits (last two bytes before the empty bit payload) to
        // exceed the compressed-stream limit.
        let len = msg.len();
        msg[len - 2..].copy_from_slice(&u16::MAX.to_le_bytes());
        assert_eq!(Message::decode(&msg), Err(WireError::Truncated));
    }
}
