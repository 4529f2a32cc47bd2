//! In-Memory Backend
//!
//! Lock-free hashmap using DashMap, exposed through the `Backend` contract
//! so the pool can treat it like any remote store.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hashbrown::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::Value;

use super::backend::{Arity, Backend, BackendConnection, CommandInfo, StorageCommand};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Stored value
#[derive(Debug, Clone)]
pub enum Entry {
    Str(Bytes),
    Hash(HashMap<Bytes, Bytes>),
}

/// Shared keyspace behind every connection of one backend
///
/// Each DashMap shard has its own lock, allowing parallel reads and writes
/// across different keys.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<Bytes, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Bytes) -> Result<Option<Bytes>> {
        match self.inner.get(key).as_deref() {
            None => Ok(None),
            Some(Entry::Str(v)) => Ok(Some(v.clone())),
            Some(Entry::Hash(_)) => Err(Error::Backend(WRONGTYPE.into())),
        }
    }

    pub fn set(&self, key: Bytes, value: Bytes) {
        self.inner.insert(key, Entry::Str(value));
    }

    pub fn del(&self, key: &Bytes) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn exists(&self, key: &Bytes) -> bool {
        self.inner.contains_key(key)
    }

    pub fn incr_by(&self, key: Bytes, delta: i64) -> Result<i64> {
        let mut entry = self
            .inner
            .entry(key)
            .or_insert_with(|| Entry::Str(Bytes::from_static(b"0")));
        match &mut *entry {
            Entry::Str(raw) => {
                let current: i64 = std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Backend("value is not an integer".into()))?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| Error::Backend("increment would overflow".into()))?;
                *raw = Bytes::from(next.to_string());
                Ok(next)
            }
            Entry::Hash(_) => Err(Error::Backend(WRONGTYPE.into())),
        }
    }

    /// Returns the number of newly created fields
    pub fn hset(&self, key: Bytes, pairs: Vec<(Bytes, Bytes)>) -> Result<i64> {
        let mut entry = self
            .inner
            .entry(key)
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match &mut *entry {
            Entry::Hash(fields) => {
                let mut created = 0;
                for (field, value) in pairs {
                    if fields.insert(field, value).is_none() {
                        created += 1;
                    }
                }
                Ok(created)
            }
            Entry::Str(_) => Err(Error::Backend(WRONGTYPE.into())),
        }
    }

    pub fn hget(&self, key: &Bytes, field: &Bytes) -> Result<Option<Bytes>> {
        match self.inner.get(key).as_deref() {
            None => Ok(None),
            Some(Entry::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(Entry::Str(_)) => Err(Error::Backend(WRONGTYPE.into())),
        }
    }

    pub fn hdel(&self, key: &Bytes, fields: &[Bytes]) -> Result<i64> {
        let removed = match self.inner.get_mut(key).as_deref_mut() {
            None => return Ok(0),
            Some(Entry::Hash(map)) => fields.iter().filter(|f| map.remove(*f).is_some()).count(),
            Some(Entry::Str(_)) => return Err(Error::Backend(WRONGTYPE.into())),
        };
        self.inner
            .remove_if(key, |_, e| matches!(e, Entry::Hash(m) if m.is_empty()));
        Ok(removed as i64)
    }

    /// Flat `[field, value, ...]` list sorted by field
    pub fn hgetall(&self, key: &Bytes) -> Result<Vec<Bytes>> {
        match self.inner.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Entry::Hash(fields)) => {
                let mut pairs: Vec<_> = fields.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                Ok(pairs
                    .into_iter()
                    .flat_map(|(f, v)| [f.clone(), v.clone()])
                    .collect())
            }
            Some(Entry::Str(_)) => Err(Error::Backend(WRONGTYPE.into())),
        }
    }

    pub fn flush(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Backend kind `"memory"`
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: MemoryStore,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self, _addr: &str) -> Result<Box<dyn BackendConnection>> {
        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
            open: true,
        }))
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        use Arity::*;
        let info = match name {
            "GET" => CommandInfo::read(Exact(0)),
            "EXISTS" => CommandInfo::read(Exact(0)),
            "HGET" => CommandInfo::read(Exact(1)),
            "HGETALL" => CommandInfo::read(Exact(0)).as_map(),
            "SET" => CommandInfo::write(Exact(1)),
            "DEL" => CommandInfo::write(Exact(0)),
            "INCR" => CommandInfo::write(Exact(0)),
            "INCRBY" => CommandInfo::write(Exact(1)),
            "HSET" => CommandInfo::write(AtLeast(2)),
            "HDEL" => CommandInfo::write(AtLeast(1)),
            "FLUSHALL" => CommandInfo::admin(Exact(0)),
            _ => return None,
        };
        Some(info)
    }
}

fn arg(args: &[Bytes], index: usize) -> Result<&Bytes> {
    args.get(index)
        .ok_or_else(|| Error::MalformedArguments(format!("missing argument {}", index)))
}

/// Connection handle onto the shared store
pub struct MemoryConnection {
    store: MemoryStore,
    open: bool,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn execute(&mut self, command: &StorageCommand) -> Result<Value> {
        if !self.open {
            return Err(Error::StorageConnectionLost);
        }
        let store = &self.store;
        let key = command.key.clone();
        let args = &command.args;

        let value = match command.name.as_str() {
            "GET" => store.get(&key)?.map(Value::Bytes).unwrap_or(Value::Nil),
            "EXISTS" => Value::Int(store.exists(&key) as i64),
            "SET" => {
                store.set(key, arg(args, 0)?.clone());
                Value::ok()
            }
            "DEL" => Value::Int(store.del(&key) as i64),
            "INCR" => Value::Int(store.incr_by(key, 1)?),
            "INCRBY" => {
                let delta: i64 = std::str::from_utf8(arg(args, 0)?)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::MalformedArguments("INCRBY delta must be an integer".into()))?;
                Value::Int(store.incr_by(key, delta)?)
            }
            "HSET" => {
                if args.len() % 2 != 0 {
                    return Err(Error::MalformedArguments(
                        "HSET takes field/value pairs".into(),
                    ));
                }
                let pairs = args
                    .chunks(2)
                    .map(|p| (p[0].clone(), p[1].clone()))
                    .collect();
                Value::Int(store.hset(key, pairs)?)
            }
            "HGET" => store.hget(&key, arg(args, 0)?)?.map(Value::Bytes).unwrap_or(Value::Nil),
            "HDEL" => Value::Int(store.hdel(&key, args)?),
            "HGETALL" => Value::List(store.hgetall(&key)?.into_iter().map(Value::Bytes).collect()),
            "FLUSHALL" => {
                store.flush();
                Value::ok()
            }
            other => return Err(Error::UnsupportedCommand(other.to_string())),
        };
        Ok(value)
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
