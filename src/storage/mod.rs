//! Storage Layer
//!
//! Backend contract, the bundled in-memory backend and the connection pool.

mod backend;
mod memory;
mod pool;

pub use backend::{backend_for, Arity, Backend, BackendConnection, CommandInfo, StorageCommand};
pub use memory::{MemoryBackend, MemoryConnection, MemoryStore};
pub use pool::{PoolConfig, StoragePool};
