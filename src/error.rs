//! Error Types
//!
//! One taxonomy shared by dispatch, storage, fan-out and the cluster layer.
//! Errors are `Clone` so they can travel inside pushed `ActionReturn`s.

use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("Malformed arguments: {0}")]
    MalformedArguments(String),

    #[error("Authentication failure")]
    AuthenticationFailure,

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Storage timeout")]
    StorageTimeout,

    #[error("Storage connection lost")]
    StorageConnectionLost,

    #[error("Storage pool closed")]
    StorageClosed,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Cluster connection unreachable: {0}")]
    ClusterConnectionUnreachable(String),

    #[error("Invalid config: {0}")]
    ConfigInvalid(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport-level failures after which a connection must be replaced
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StorageConnectionLost | Error::Io(_))
    }

    /// Stable wire code for this error kind
    pub fn code(&self) -> u8 {
        match self {
            Error::UnsupportedCommand(_) => 1,
            Error::MalformedArguments(_) => 2,
            Error::AuthenticationFailure => 3,
            Error::MalformedReply(_) => 4,
            Error::StorageTimeout => 5,
            Error::StorageConnectionLost => 6,
            Error::StorageClosed => 7,
            Error::Backend(_) => 8,
            Error::ClusterConnectionUnreachable(_) => 9,
            Error::ConfigInvalid(_) => 10,
            Error::Protocol(_) => 11,
            Error::Io(_) => 12,
        }
    }

    /// Message carried next to the code on the wire
    pub fn detail(&self) -> String {
        match self {
            Error::UnsupportedCommand(m)
            | Error::MalformedArguments(m)
            | Error::MalformedReply(m)
            | Error::Backend(m)
            | Error::ClusterConnectionUnreachable(m)
            | Error::ConfigInvalid(m)
            | Error::Protocol(m)
            | Error::Io(m) => m.clone(),
            _ => String::new(),
        }
    }

    /// Rebuild an error from its wire code and detail
    pub fn from_code(code: u8, detail: String) -> Self {
        match code {
            1 => Error::UnsupportedCommand(detail),
            2 => Error::MalformedArguments(detail),
            3 => Error::AuthenticationFailure,
            4 => Error::MalformedReply(detail),
            5 => Error::StorageTimeout,
            6 => Error::StorageConnectionLost,
            7 => Error::StorageClosed,
            8 => Error::Backend(detail),
            9 => Error::ClusterConnectionUnreachable(detail),
            10 => Error::ConfigInvalid(detail),
            12 => Error::Io(detail),
            _ => Error::Protocol(detail),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_preserves_kind() {
        let errors = [
            Error::UnsupportedCommand("FOO".into()),
            Error::AuthenticationFailure,
            Error::StorageTimeout,
            Error::Backend("WRONGTYPE".into()),
        ];
        for err in errors {
            assert_eq!(Error::from_code(err.code(), err.detail()), err);
        }
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::StorageConnectionLost.is_fatal());
        assert!(Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")).is_fatal());
        assert!(!Error::Backend("bad".into()).is_fatal());
        assert!(!Error::StorageTimeout.is_fatal());
    }
}
