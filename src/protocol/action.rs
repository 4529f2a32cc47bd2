//! Actions and Returns
//!
//! Request/response shapes exchanged with clients and peers.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::security;

/// Opaque result value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Int(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn ok() -> Self {
        Value::Bytes(Bytes::from_static(b"OK"))
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn str(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

/// One parsed client request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    /// Command name as sent by the client
    pub command: String,
    /// Storage key the command acts on
    pub key: Bytes,
    /// Positional arguments after the key
    pub args: Vec<Bytes>,
    /// Identity the requester signs with
    pub requester: String,
    /// Raw HMAC-SHA1 digest over command, key and requester
    pub secret: Option<Bytes>,
}

impl Action {
    pub fn new(command: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn with_secret(mut self, digest: impl Into<Bytes>) -> Self {
        self.secret = Some(digest.into());
        self
    }

    /// Attach the digest of this action computed with `secret`
    pub fn signed(self, secret: &[u8]) -> Self {
        let digest = security::sign(secret, &self.command, &self.key, &self.requester);
        self.with_secret(digest)
    }
}

/// Response to one action, also the shape of every push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReturn(pub Result<Value>);

impl ActionReturn {
    pub fn ok(value: Value) -> Self {
        Self(Ok(value))
    }

    pub fn err(error: Error) -> Self {
        Self(Err(error))
    }

    pub fn is_ok(&self) -> bool {
        self.0.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.0.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.0.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value> {
        self.0
    }
}

impl From<Result<Value>> for ActionReturn {
    fn from(result: Result<Value>) -> Self {
        Self(result)
    }
}

/// Leading element of every key-change push
pub const CHANGE_TAG: &str = "CHANGE";

/// Command name of the synthetic notification sent when an ekg client leaves
pub const DISCONNECT: &str = "disconnect";

/// "This key changed" notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub command: String,
    pub key: Bytes,
    pub args: Vec<Bytes>,
}

impl KeyChange {
    pub fn new(command: impl Into<String>, key: Bytes, args: Vec<Bytes>) -> Self {
        Self {
            command: command.into(),
            key,
            args,
        }
    }

    pub fn disconnect(key: Bytes, label: Option<String>) -> Self {
        let args = label.map(|l| vec![Bytes::from(l)]).unwrap_or_default();
        Self::new(DISCONNECT, key, args)
    }

    /// `List["CHANGE", command, key, args...]`
    pub fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(3 + self.args.len());
        items.push(Value::str(CHANGE_TAG));
        items.push(Value::str(&self.command));
        items.push(Value::Bytes(self.key.clone()));
        items.extend(self.args.iter().cloned().map(Value::Bytes));
        Value::List(items)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let items = value
            .as_list()
            .ok_or_else(|| Error::Protocol("key change must be a list".into()))?;
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            let b = item
                .as_bytes()
                .ok_or_else(|| Error::Protocol("key change elements must be bytes".into()))?;
            parts.push(b.clone());
        }
        if parts.len() < 3 || parts[0].as_ref() != CHANGE_TAG.as_bytes() {
            return Err(Error::Protocol("not a key change".into()));
        }
        let mut parts = parts.into_iter().skip(1);
        let command = parts.next().unwrap_or_default();
        let command = String::from_utf8(command.to_vec())
            .map_err(|_| Error::Protocol("command name is not UTF-8".into()))?;
        let key = parts.next().unwrap_or_default();
        Ok(Self {
            command,
            key,
            args: parts.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_change_value_shape() {
        let change = KeyChange::new("SET", Bytes::from_static(b"foo"), vec![Bytes::from_static(b"bar")]);
        let value = change.to_value();
        assert_eq!(
            value,
            Value::List(vec![
                Value::str("CHANGE"),
                Value::str("SET"),
                Value::str("foo"),
                Value::str("bar"),
            ])
        );
        assert_eq!(KeyChange::from_value(&value).unwrap(), change);
    }

    #[test]
    fn test_key_change_rejects_other_pushes() {
        let message = Value::List(vec![Value::str("MESSAGE"), Value::str("t1"), Value::str("hi")]);
        assert!(KeyChange::from_value(&message).is_err());
        assert!(KeyChange::from_value(&Value::Int(3)).is_err());
    }

    #[test]
    fn test_disconnect_carries_label() {
        let change = KeyChange::disconnect(Bytes::from_static(b"k"), Some("worker-1".into()));
        assert_eq!(change.command, DISCONNECT);
        assert_eq!(change.args, vec![Bytes::from_static(b"worker-1")]);
    }
}
