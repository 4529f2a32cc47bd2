//! Wire Frame Structure
//!
//! Binary frame format with 22-byte header. Payloads carry an encoded
//! `Action` (client to node) or `ActionReturn` (replies and pushes).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

use crate::error::{Error, Result};

use super::action::{Action, ActionReturn, Value};

/// Magic bytes identifying the protocol: "KWIR"
pub const MAGIC: [u8; 4] = [0x4B, 0x57, 0x49, 0x52];

/// Protocol version
pub const VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 22;

/// Nesting limit for decoded values
const MAX_DEPTH: usize = 32;

/// Frame operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Request carrying an `Action`
    Action = 0x01,
    /// Reply to the request with the same id
    Return = 0x02,
    /// Unsolicited notification (request id 0)
    Push = 0x03,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(OpCode::Action),
            0x02 => Some(OpCode::Return),
            0x03 => Some(OpCode::Push),
            _ => None,
        }
    }
}

/// Frame Header (22 bytes)
///
/// ```text
/// ┌──────────┬──────────┬──────────┬──────────┬─────────────────┐
/// │  Magic   │ Version  │  OpCode  │  Flags   │  Payload Len    │
/// │ (4 bytes)│ (1 byte) │ (1 byte) │ (2 bytes)│   (4 bytes)     │
/// ├──────────┴──────────┴──────────┴──────────┴─────────────────┤
/// │  Request ID (8 bytes)  │  Reserved (2 bytes)                │
/// └─────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub opcode: OpCode,
    pub flags: u16,
    pub payload_len: u32,
    pub request_id: u64,
}

impl FrameHeader {
    pub fn new(opcode: OpCode, request_id: u64) -> Self {
        Self {
            version: VERSION,
            opcode,
            flags: 0,
            payload_len: 0,
            request_id,
        }
    }

    pub fn with_payload_len(mut self, len: u32) -> Self {
        self.payload_len = len;
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.opcode as u8);
        buf.put_u16(self.flags);
        buf.put_u32(self.payload_len);
        buf.put_u64(self.request_id);
        buf.put_u16(0); // Reserved
    }

    /// Decode a header; `buf` must hold at least `HEADER_SIZE` bytes
    pub fn decode(buf: &mut impl Buf) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let version = buf.get_u8();
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported version: {}", version),
            ));
        }
        let opcode_byte = buf.get_u8();
        let opcode = OpCode::from_u8(opcode_byte).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Invalid opcode: {}", opcode_byte))
        })?;
        let flags = buf.get_u16();
        let payload_len = buf.get_u32();
        let request_id = buf.get_u64();
        let _reserved = buf.get_u16();

        Ok(Self {
            version,
            opcode,
            flags,
            payload_len,
            request_id,
        })
    }
}

/// Complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, request_id: u64, payload: Bytes) -> Self {
        let header = FrameHeader::new(opcode, request_id).with_payload_len(payload.len() as u32);
        Self { header, payload }
    }

    pub fn action(request_id: u64, action: &Action) -> Self {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, action.command.as_bytes());
        put_bytes(&mut buf, &action.key);
        put_bytes(&mut buf, action.requester.as_bytes());
        match &action.secret {
            Some(secret) => {
                buf.put_u8(1);
                put_bytes(&mut buf, secret);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32(action.args.len() as u32);
        for arg in &action.args {
            put_bytes(&mut buf, arg);
        }
        Self::new(OpCode::Action, request_id, buf.freeze())
    }

    pub fn ret(request_id: u64, ret: &ActionReturn) -> Self {
        Self::new(OpCode::Return, request_id, encode_return(ret))
    }

    pub fn push(push: &ActionReturn) -> Self {
        Self::new(OpCode::Push, 0, encode_return(push))
    }

    pub fn to_action(&self) -> Result<Action> {
        if self.header.opcode != OpCode::Action {
            return Err(Error::Protocol(format!(
                "Expected action frame, got {:?}",
                self.header.opcode
            )));
        }
        let mut r = Reader::new(self.payload.clone());
        let command = r.string()?;
        let key = r.bytes()?;
        let requester = r.string()?;
        let secret = match r.u8()? {
            0 => None,
            _ => Some(r.bytes()?),
        };
        let argc = r.u32()? as usize;
        let mut args = Vec::with_capacity(argc.min(1024));
        for _ in 0..argc {
            args.push(r.bytes()?);
        }
        Ok(Action {
            command,
            key,
            args,
            requester,
            secret,
        })
    }

    pub fn to_return(&self) -> Result<ActionReturn> {
        match self.header.opcode {
            OpCode::Return | OpCode::Push => {}
            other => {
                return Err(Error::Protocol(format!(
                    "Expected return frame, got {:?}",
                    other
                )))
            }
        }
        let mut r = Reader::new(self.payload.clone());
        match r.u8()? {
            0 => Ok(ActionReturn::ok(r.value(0)?)),
            _ => {
                let code = r.u8()?;
                let detail = r.string()?;
                Ok(ActionReturn::err(Error::from_code(code, detail)))
            }
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.put_slice(&self.payload);
    }
}

fn encode_return(ret: &ActionReturn) -> Bytes {
    let mut buf = BytesMut::new();
    match &ret.0 {
        Ok(value) => {
            buf.put_u8(0);
            put_value(&mut buf, value);
        }
        Err(err) => {
            buf.put_u8(1);
            buf.put_u8(err.code());
            put_bytes(&mut buf, err.detail().as_bytes());
        }
    }
    buf.freeze()
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Nil => buf.put_u8(0),
        Value::Int(n) => {
            buf.put_u8(1);
            buf.put_i64(*n);
        }
        Value::Bytes(b) => {
            buf.put_u8(2);
            put_bytes(buf, b);
        }
        Value::List(items) => {
            buf.put_u8(3);
            buf.put_u32(items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        Value::Map(pairs) => {
            buf.put_u8(4);
            buf.put_u32(pairs.len() as u32);
            for (k, v) in pairs {
                put_value(buf, k);
                put_value(buf, v);
            }
        }
    }
}

/// Bounds-checked payload reader
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Protocol("Truncated payload".into()));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("Invalid UTF-8".into()))
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::Protocol("Value nested too deeply".into()));
        }
        match self.u8()? {
            0 => Ok(Value::Nil),
            1 => Ok(Value::Int(self.i64()?)),
            2 => Ok(Value::Bytes(self.bytes()?)),
            3 => {
                let count = self.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            4 => {
                let count = self.u32()? as usize;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let k = self.value(depth + 1)?;
                    let v = self.value(depth + 1)?;
                    pairs.push((k, v));
                }
                Ok(Value::Map(pairs))
            }
            tag => Err(Error::Protocol(format!("Unknown value tag: {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = FrameHeader::new(OpCode::Action, 12345).with_payload_len(100);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.opcode, OpCode::Action);
        assert_eq!(decoded.request_id, 12345);
        assert_eq!(decoded.payload_len, 100);
    }

    #[test]
    fn test_action_frame_keeps_secret_and_args() {
        let action = Action::new("HSET", Bytes::from_static(b"user:1"))
            .with_args(["name", "bob"])
            .with_requester("bob")
            .signed(b"s1");
        let frame = Frame::action(7, &action);
        assert_eq!(frame.to_action().unwrap(), action);
    }

    #[test]
    fn test_error_return_decodes_to_same_kind() {
        let frame = Frame::ret(3, &ActionReturn::err(Error::AuthenticationFailure));
        let ret = frame.to_return().unwrap();
        assert_eq!(ret.error(), Some(&Error::AuthenticationFailure));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let action = Action::new("GET", Bytes::from_static(b"k"));
        let mut frame = Frame::action(1, &action);
        frame.payload = frame.payload.slice(..frame.payload.len() - 2);
        assert!(matches!(frame.to_action(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_nested_value_push() {
        let value = Value::Map(vec![(
            Value::str("k"),
            Value::List(vec![Value::Int(-4), Value::Nil]),
        )]);
        let frame = Frame::push(&ActionReturn::ok(value.clone()));
        assert_eq!(frame.header.request_id, 0);
        assert_eq!(frame.to_return().unwrap().value(), Some(&value));
    }
}
