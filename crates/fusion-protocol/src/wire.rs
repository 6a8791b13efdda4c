//! On-wire message frames.
//!
//! Every transport carries the same frame format: a four-word header
//! followed by the payload, with the next frame starting at the next
//! 4-byte boundary. Numeric message-type identities are part of the
//! protocol contract and must not be renumbered.

use crate::error::{FusionError, Result};
use crate::FusionId;

/// Largest single frame any back-end will carry.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Size of [`MessageHeader`] on the wire.
pub const HEADER_SIZE: usize = 16;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Send = 1,
    Enter = 2,
    Leave = 3,
    Call = 4,
    Reactor = 5,
    ShmPool = 6,
    Call3 = 7,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<MessageType> {
        Some(match raw {
            1 => MessageType::Send,
            2 => MessageType::Enter,
            3 => MessageType::Leave,
            4 => MessageType::Call,
            5 => MessageType::Reactor,
            6 => MessageType::ShmPool,
            7 => MessageType::Call3,
            _ => return None,
        })
    }
}

/// Frame header: `msg_type, msg_id, msg_channel, msg_size`.
///
/// `msg_id` carries the call id for CALL/CALL3 frames and the reactor
/// object id for REACTOR frames; `msg_channel` is only meaningful for
/// REACTOR. `msg_size` is the payload size in bytes, unaligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u32,
    pub msg_id: u32,
    pub msg_channel: u32,
    pub msg_size: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, msg_id: u32, msg_channel: u32, msg_size: usize) -> Self {
        MessageHeader {
            msg_type: msg_type as u32,
            msg_id,
            msg_channel,
            msg_size: msg_size as u32,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg_type.to_ne_bytes());
        out.extend_from_slice(&self.msg_id.to_ne_bytes());
        out.extend_from_slice(&self.msg_channel.to_ne_bytes());
        out.extend_from_slice(&self.msg_size.to_ne_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Result<MessageHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(FusionError::InvalidArgument(format!(
                "frame header truncated ({} bytes)",
                buf.len()
            )));
        }
        Ok(MessageHeader {
            msg_type: read_u32(buf, 0),
            msg_id: read_u32(buf, 4),
            msg_channel: read_u32(buf, 8),
            msg_size: read_u32(buf, 12),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Build a complete frame (header + payload) ready for a transport.
pub fn build_frame(
    msg_type: MessageType,
    msg_id: u32,
    msg_channel: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + align4(payload.len()));
    MessageHeader::new(msg_type, msg_id, msg_channel, payload.len()).write_to(&mut out);
    out.extend_from_slice(payload);
    out.resize(HEADER_SIZE + align4(payload.len()), 0);
    out
}

/// Walks a receive buffer frame by frame.
///
/// Frames within one buffer are yielded in arrival order; the cursor
/// advances by `HEADER_SIZE + align4(msg_size)` so payload padding never
/// leaks into the next header.
pub struct FrameCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FrameCursor { buf, pos: 0 }
    }
}

impl<'a> Iterator for FrameCursor<'a> {
    type Item = Result<(MessageHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let header = match MessageHeader::read_from(&self.buf[self.pos..]) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        let data_start = self.pos + HEADER_SIZE;
        let data_end = data_start + header.msg_size as usize;
        if data_end > self.buf.len() {
            return Some(Err(FusionError::InvalidArgument(format!(
                "frame payload truncated ({} of {} bytes)",
                self.buf.len() - data_start,
                header.msg_size
            ))));
        }
        self.pos = data_start + align4(header.msg_size as usize);
        Some(Ok((header, &self.buf[data_start..data_end])))
    }
}

// -------------------------------------------------------------------------------------------------
// Typed payloads
// -------------------------------------------------------------------------------------------------

/// Socket-mode handshake. The master records the entrant's pid and echoes
/// the frame back to the sender's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterMessage {
    pub fusion_id: FusionId,
    pub pid: u32,
}

impl EnterMessage {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_SIZE);
        payload.extend_from_slice(&self.fusion_id.0.to_ne_bytes());
        payload.extend_from_slice(&self.pid.to_ne_bytes());
        build_frame(MessageType::Enter, 0, 0, &payload)
    }

    pub fn decode(payload: &[u8]) -> Result<EnterMessage> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(FusionError::InvalidArgument("short ENTER payload".into()));
        }
        Ok(EnterMessage {
            fusion_id: FusionId(read_u32(payload, 0)),
            pid: read_u32(payload, 4),
        })
    }
}

/// Announces that a participant has left (or died).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveMessage {
    pub fusion_id: FusionId,
}

impl LeaveMessage {
    pub const WIRE_SIZE: usize = 4;

    pub fn to_frame(&self) -> Vec<u8> {
        build_frame(MessageType::Leave, 0, 0, &self.fusion_id.0.to_ne_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<LeaveMessage> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(FusionError::InvalidArgument("short LEAVE payload".into()));
        }
        Ok(LeaveMessage {
            fusion_id: FusionId(read_u32(payload, 0)),
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u32 {
        /// Fire and forget; no response frame is produced.
        const ONEWAY = 0x0000_0001;
        /// This frame carries the result of an earlier call.
        const RETURN = 0x0000_0002;
    }
}

/// CALL payload. The call id travels in the frame header's `msg_id`.
///
/// Extra argument bytes, when present, follow the fixed part; their length
/// is `msg_size - WIRE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMessage {
    pub caller: FusionId,
    pub call_arg: i32,
    pub ret_val: i32,
    pub serial: u32,
    pub flags: CallFlags,
}

impl CallMessage {
    pub const WIRE_SIZE: usize = 20;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.caller.0.to_ne_bytes());
        out.extend_from_slice(&self.call_arg.to_ne_bytes());
        out.extend_from_slice(&self.ret_val.to_ne_bytes());
        out.extend_from_slice(&self.serial.to_ne_bytes());
        out.extend_from_slice(&self.flags.bits().to_ne_bytes());
    }

    pub fn to_frame(&self, call_id: u32, extra: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_SIZE + extra.len());
        self.encode(&mut payload);
        payload.extend_from_slice(extra);
        build_frame(MessageType::Call, call_id, 0, &payload)
    }

    /// Split a CALL payload into the fixed part and the optional extra
    /// argument bytes.
    pub fn decode(payload: &[u8]) -> Result<(CallMessage, &[u8])> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(FusionError::InvalidArgument("short CALL payload".into()));
        }
        let msg = CallMessage {
            caller: FusionId(read_u32(payload, 0)),
            call_arg: read_i32(payload, 4),
            ret_val: read_i32(payload, 8),
            serial: read_u32(payload, 12),
            flags: CallFlags::from_bits_truncate(read_u32(payload, 16)),
        };
        Ok((msg, &payload[Self::WIRE_SIZE..]))
    }
}

/// CALL3 payload: a CALL plus a return-buffer descriptor.
///
/// `ret_size` is the capacity the caller reserved; `ret_length` is filled
/// by the handler and travels back in the RETURN frame together with up to
/// `ret_length` bytes of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call3Message {
    pub call: CallMessage,
    pub ret_size: u32,
    pub ret_length: u32,
}

impl Call3Message {
    pub const WIRE_SIZE: usize = CallMessage::WIRE_SIZE + 8;

    pub fn to_frame(&self, call_id: u32, extra: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_SIZE + extra.len());
        self.call.encode(&mut payload);
        payload.extend_from_slice(&self.ret_size.to_ne_bytes());
        payload.extend_from_slice(&self.ret_length.to_ne_bytes());
        payload.extend_from_slice(extra);
        build_frame(MessageType::Call3, call_id, 0, &payload)
    }

    pub fn decode(payload: &[u8]) -> Result<(Call3Message, &[u8])> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(FusionError::InvalidArgument("short CALL3 payload".into()));
        }
        let (call, rest) = CallMessage::decode(payload)?;
        Ok((
            Call3Message {
                call,
                ret_size: read_u32(rest, 0),
                ret_length: read_u32(rest, 4),
            },
            &rest[8..],
        ))
    }
}

/// REACTOR frame helper; the payload is opaque to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorMessage {
    pub reactor_id: u32,
    pub channel: u32,
}

impl ReactorMessage {
    pub fn to_frame(&self, payload: &[u8]) -> Vec<u8> {
        build_frame(MessageType::Reactor, self.reactor_id, self.channel, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShmPoolOp {
    Attach = 1,
    Detach = 2,
}

/// Pool maintenance request; `msg_id` in the header names the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmPoolMessage {
    pub op: ShmPoolOp,
    pub size: u64,
}

impl ShmPoolMessage {
    pub const WIRE_SIZE: usize = 12;

    pub fn to_frame(&self, pool_id: u32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_SIZE);
        payload.extend_from_slice(&(self.op as u32).to_ne_bytes());
        payload.extend_from_slice(&self.size.to_ne_bytes());
        build_frame(MessageType::ShmPool, pool_id, 0, &payload)
    }

    pub fn decode(payload: &[u8]) -> Result<ShmPoolMessage> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(FusionError::InvalidArgument("short SHMPOOL payload".into()));
        }
        let op = match read_u32(payload, 0) {
            1 => ShmPoolOp::Attach,
            2 => ShmPoolOp::Detach,
            other => {
                return Err(FusionError::InvalidArgument(format!(
                    "unknown pool op {other}"
                )))
            }
        };
        Ok(ShmPoolMessage {
            op,
            size: u64::from_ne_bytes(payload[4..12].try_into().unwrap()),
        })
    }
}

/// A zero-payload SEND frame; wakes the dispatcher without carrying data.
pub fn wakeup_frame() -> Vec<u8> {
    build_frame(MessageType::Send, 0, 0, &[])
}
