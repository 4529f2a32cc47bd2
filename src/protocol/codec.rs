//! Message Codec
//!
//! Frames are decoded straight into typed [`Message`]s so the server and
//! peer links never look at opcodes or raw payloads.

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

use super::action::{Action, ActionReturn};
use super::frame::{Frame, FrameHeader, OpCode, HEADER_SIZE};

/// Default payload bound (4 MiB)
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Buffer growth per read while a large payload is still arriving
const RESERVE_CHUNK: usize = 64 * 1024;

/// One unit of the wire protocol
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request answered by a `Return` carrying the same id
    Action { id: u64, action: Action },
    Return { id: u64, ret: ActionReturn },
    /// Unsolicited notification
    Push(ActionReturn),
    /// Correctly framed, but the payload did not decode.
    /// Only produced by the decoder; the stream stays usable.
    Malformed { id: u64, opcode: OpCode, error: Error },
}

impl Message {
    /// Request id; pushes carry 0
    pub fn id(&self) -> u64 {
        match self {
            Message::Action { id, .. } | Message::Return { id, .. } | Message::Malformed { id, .. } => *id,
            Message::Push(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Action { .. } => "action",
            Message::Return { .. } => "return",
            Message::Push(_) => "push",
            Message::Malformed { .. } => "malformed",
        }
    }

    fn from_frame(frame: Frame) -> Self {
        let id = frame.header.request_id;
        let opcode = frame.header.opcode;
        let decoded = match opcode {
            OpCode::Action => frame.to_action().map(|action| Message::Action { id, action }),
            OpCode::Return => frame.to_return().map(|ret| Message::Return { id, ret }),
            OpCode::Push => frame.to_return().map(Message::Push),
        };
        decoded.unwrap_or_else(|error| Message::Malformed { id, opcode, error })
    }

    fn to_frame(&self) -> Option<Frame> {
        match self {
            Message::Action { id, action } => Some(Frame::action(*id, action)),
            Message::Return { id, ret } => Some(Frame::ret(*id, ret)),
            Message::Push(push) => Some(Frame::push(push)),
            Message::Malformed { .. } => None,
        }
    }
}

/// Tokio codec between byte streams and [`Message`]s
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_payload: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek; nothing is consumed until the whole frame is here
        let header = FrameHeader::decode(&mut &src[..HEADER_SIZE])?;
        let payload_len = header.payload_len as usize;
        if payload_len > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload of {} bytes exceeds {}", payload_len, self.max_payload),
            ));
        }

        let missing = (HEADER_SIZE + payload_len).saturating_sub(src.len());
        if missing > 0 {
            src.reserve(missing.min(RESERVE_CHUNK));
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Message::from_frame(Frame { header, payload })))
    }
}

impl Encoder<Message> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.to_frame().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "malformed messages cannot be sent")
        })?;
        if frame.payload.len() > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds {}", frame.payload.len(), self.max_payload),
            ));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        frame.encode(dst);
        Ok(())
    }
}
