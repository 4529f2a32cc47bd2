//! Backend Contract
//!
//! What the coordination layer needs from a backing store: a command table
//! and connections that execute commands.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::Value;

use super::memory::MemoryBackend;

/// Argument count rule for a command (arguments after the key)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn check(&self, command: &str, got: usize) -> Result<()> {
        let ok = match *self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
        };
        if ok {
            return Ok(());
        }
        let expected = match *self {
            Arity::Exact(n) => format!("exactly {}", n),
            Arity::AtLeast(n) => format!("at least {}", n),
        };
        Err(Error::MalformedArguments(format!(
            "{} takes {} argument(s), got {}",
            command, expected, got
        )))
    }
}

/// Static metadata for one command name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub modifies: bool,
    pub admin: bool,
    pub returns_list_as_map: bool,
    pub arity: Arity,
}

impl CommandInfo {
    pub const fn read(arity: Arity) -> Self {
        Self {
            modifies: false,
            admin: false,
            returns_list_as_map: false,
            arity,
        }
    }

    pub const fn write(arity: Arity) -> Self {
        Self {
            modifies: true,
            ..Self::read(arity)
        }
    }

    pub const fn admin(arity: Arity) -> Self {
        Self {
            admin: true,
            ..Self::read(arity)
        }
    }

    pub const fn as_map(self) -> Self {
        Self {
            returns_list_as_map: true,
            ..self
        }
    }

    /// Whether the action must carry a valid HMAC
    pub fn needs_auth(&self) -> bool {
        self.modifies || self.admin
    }
}

/// Command handed to a backend connection. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCommand {
    pub name: String,
    pub key: Bytes,
    pub args: Vec<Bytes>,
}

impl StorageCommand {
    pub fn new(name: impl Into<String>, key: Bytes, args: Vec<Bytes>) -> Self {
        Self {
            name: name.into(),
            key,
            args,
        }
    }
}

/// One live connection to the backing store
#[async_trait]
pub trait BackendConnection: Send {
    /// Execute one command. Fatal errors (`Error::is_fatal`) mean the
    /// connection is unusable and must be replaced.
    async fn execute(&mut self, command: &StorageCommand) -> Result<Value>;

    async fn close(&mut self) -> Result<()>;
}

/// A kind of backing store
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> Result<Box<dyn BackendConnection>>;

    /// Metadata for a pass-through command, `None` if not allowed
    fn command_info(&self, name: &str) -> Option<CommandInfo>;

    fn is_command_allowed(&self, name: &str) -> bool {
        self.command_info(name).is_some()
    }

    fn does_command_modify(&self, name: &str) -> bool {
        self.command_info(name).map(|i| i.modifies).unwrap_or(false)
    }

    fn is_command_admin(&self, name: &str) -> bool {
        self.command_info(name).map(|i| i.admin).unwrap_or(false)
    }

    fn new_command(&self, name: &str, key: Bytes, args: Vec<Bytes>) -> StorageCommand {
        StorageCommand::new(name, key, args)
    }
}

/// Resolve a configured backend kind
pub fn backend_for(kind: &str) -> Result<Arc<dyn Backend>> {
    match kind {
        "memory" => Ok(Arc::new(MemoryBackend::new())),
        other => Err(Error::ConfigInvalid(format!(
            "unknown storage kind: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_rules() {
        assert!(Arity::Exact(1).check("SET", 1).is_ok());
        assert!(Arity::Exact(1).check("SET", 2).is_err());
        assert!(Arity::AtLeast(1).check("HDEL", 3).is_ok());
        assert!(matches!(
            Arity::AtLeast(1).check("HDEL", 0),
            Err(Error::MalformedArguments(_))
        ));
    }

    #[test]
    fn test_backend_for_rejects_unknown_kind() {
        assert!(backend_for("memory").is_ok());
        assert!(matches!(backend_for("redis"), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_default_flag_queries() {
        let backend = MemoryBackend::new();
        assert!(backend.is_command_allowed("GET"));
        assert!(!backend.is_command_allowed("EVAL"));
        assert!(backend.does_command_modify("SET"));
        assert!(backend.is_command_admin("FLUSHALL"));
        assert!(!backend.is_command_admin("SET"));
    }
}
