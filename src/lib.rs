//! KEYWIRE - Clustered Key/Value Coordination Layer
//!
//! Sits in front of a simple backing store: authorizes mutating commands
//! with HMAC-SHA1, executes them over a pooled backend connection and fans
//! "this key changed" notifications out to local watchers and peer nodes.

pub mod client;
pub mod cluster;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod protocol;
pub mod security;
pub mod server;
pub mod storage;

pub use client::{Client, ClientId};
pub use cluster::{ClusterConfig, ClusterManager, ConnectionState, ReconcileReport};
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use fanout::{Fanout, CHANGES_TOPIC};
pub use metrics::Metrics;
pub use protocol::{Action, ActionReturn, KeyChange, Message, Value, WireCodec};
pub use server::{Config, Node};
pub use storage::{Backend, MemoryBackend, StoragePool};
