//! Wire Protocol
//!
//! Actions, returns and the binary frame format used by the TCP front end
//! and by peer links. Uses 22-byte fixed headers.

mod action;
mod codec;
mod frame;

pub use action::{Action, ActionReturn, KeyChange, Value, CHANGE_TAG, DISCONNECT};
pub use codec::{Message, WireCodec, MAX_PAYLOAD};
pub use frame::{Frame, FrameHeader, OpCode, HEADER_SIZE, MAGIC};
