//! Storage Connection Pool
//!
//! A fixed number of equivalent backend connections behind one `execute`
//! call. Each connection is owned by exactly one worker task; workers pull
//! jobs from a shared queue, so whichever worker is idle takes the next
//! command. A worker whose connection dies stops taking work, resurrects its
//! connection on a fixed interval and then rejoins the pool.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::Value;

use super::backend::{Backend, BackendConnection, StorageCommand};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of backend connections
    pub size: usize,
    /// Bound on handing a command to a worker, and separately on its reply
    pub timeout: Duration,
    /// Delay between reconnection attempts for a lost connection
    pub reconnect_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

struct Job {
    command: StorageCommand,
    reply: oneshot::Sender<Result<Value>>,
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// Pool of backend connections
pub struct StoragePool {
    jobs: mpsc::Sender<Job>,
    config: PoolConfig,
    closing: CancellationToken,
    live: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StoragePool {
    /// Open `config.size` connections to `addr`. All-or-nothing: if any
    /// connection fails, the ones already opened are closed again.
    pub async fn connect(backend: Arc<dyn Backend>, addr: &str, config: PoolConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(Error::ConfigInvalid("pool size must be at least 1".into()));
        }

        let mut connections = Vec::with_capacity(config.size);
        for i in 0..config.size {
            match backend.connect(addr).await {
                Ok(conn) => connections.push(conn),
                Err(e) => {
                    warn!(addr, index = i, error = %e, "Storage connect failed, closing opened connections");
                    for mut conn in connections {
                        let _ = conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(rx));
        let closing = CancellationToken::new();
        let live = Arc::new(AtomicUsize::new(connections.len()));

        let handles = connections
            .into_iter()
            .enumerate()
            .map(|(id, conn)| {
                let worker = Worker {
                    id,
                    backend: backend.clone(),
                    addr: addr.to_string(),
                    jobs: queue.clone(),
                    closing: closing.clone(),
                    live: live.clone(),
                    reconnect_interval: config.reconnect_interval,
                };
                tokio::spawn(worker.run(conn))
            })
            .collect();

        info!(addr, size = config.size, "Storage pool connected");

        Ok(Self {
            jobs: tx,
            config,
            closing,
            live,
            workers: Mutex::new(handles),
        })
    }

    /// Execute a command on any idle connection
    pub async fn execute(&self, command: StorageCommand) -> Result<Value> {
        if self.closing.is_cancelled() {
            return Err(Error::StorageClosed);
        }

        let (tx, rx) = oneshot::channel();
        let job = Job { command, reply: tx };

        match timeout(self.config.timeout, self.jobs.send(job)).await {
            Err(_) => return Err(Error::StorageTimeout),
            Ok(Err(_)) => return Err(Error::StorageClosed),
            Ok(Ok(())) => {}
        }

        match timeout(self.config.timeout, rx).await {
            Err(_) => Err(Error::StorageTimeout),
            Ok(Err(_)) if self.closing.is_cancelled() => Err(Error::StorageClosed),
            Ok(Err(_)) => Err(Error::StorageConnectionLost),
            Ok(Ok(result)) => result,
        }
    }

    /// Close every connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if timeout(self.config.timeout, handle).await.is_err() {
                warn!("Storage worker did not stop in time");
            }
        }
        info!("Storage pool closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Configured number of connections
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Connections currently usable (not resurrecting)
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for StoragePool {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

struct Worker {
    id: usize,
    backend: Arc<dyn Backend>,
    addr: String,
    jobs: JobQueue,
    closing: CancellationToken,
    live: Arc<AtomicUsize>,
    reconnect_interval: Duration,
}

impl Worker {
    async fn run(self, mut conn: Box<dyn BackendConnection>) {
        debug!(worker = self.id, "Storage worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                job = next_job(&self.jobs) => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match conn.execute(&job.command).await {
                Err(e) if e.is_fatal() => {
                    let _ = job.reply.send(Err(Error::StorageConnectionLost));
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    warn!(worker = self.id, error = %e, "Storage connection lost, resurrecting");
                    let _ = conn.close().await;

                    match self.resurrect().await {
                        Some(fresh) => {
                            conn = fresh;
                            self.live.fetch_add(1, Ordering::SeqCst);
                        }
                        None => {
                            debug!(worker = self.id, "Storage worker stopped while resurrecting");
                            return;
                        }
                    }
                }
                result => {
                    // Caller may have timed out; the result is discarded then
                    let _ = job.reply.send(result);
                }
            }
        }

        let _ = conn.close().await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!(worker = self.id, "Storage worker stopped");
    }

    /// Retry until connected or the pool closes
    async fn resurrect(&self) -> Option<Box<dyn BackendConnection>> {
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => return None,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }

            attempt += 1;
            match self.backend.connect(&self.addr).await {
                Ok(conn) => {
                    info!(worker = self.id, attempt, "Storage connection resurrected");
                    return Some(conn);
                }
                Err(e) => {
                    debug!(worker = self.id, attempt, error = %e, "Storage reconnect failed");
                }
            }
        }
    }
}

async fn next_job(jobs: &JobQueue) -> Option<Job> {
    jobs.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Arity, CommandInfo, MemoryBackend};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Semaphore;

    fn get(key: &'static [u8]) -> StorageCommand {
        StorageCommand::new("GET", Bytes::from_static(key), vec![])
    }

    /// Backend whose executes wait on a gate and report concurrency
    struct GatedBackend {
        gate: Arc<Semaphore>,
        running: Arc<AtomicUsize>,
        connects: AtomicUsize,
        fail_connect_at: Option<usize>,
        closed: Arc<AtomicUsize>,
        break_next: Arc<AtomicBool>,
    }

    impl GatedBackend {
        fn new() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                running: Arc::default(),
                connects: AtomicUsize::new(0),
                fail_connect_at: None,
                closed: Arc::default(),
                break_next: Arc::default(),
            }
        }
    }

    struct GatedConnection {
        gate: Arc<Semaphore>,
        running: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        break_next: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Backend for GatedBackend {
        async fn connect(&self, _addr: &str) -> Result<Box<dyn BackendConnection>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_connect_at {
                return Err(Error::Io("connection refused".into()));
            }
            Ok(Box::new(GatedConnection {
                gate: self.gate.clone(),
                running: self.running.clone(),
                closed: self.closed.clone(),
                break_next: self.break_next.clone(),
            }))
        }

        fn command_info(&self, _name: &str) -> Option<CommandInfo> {
            Some(CommandInfo::read(Arity::Exact(0)))
        }
    }

    #[async_trait]
    impl BackendConnection for GatedConnection {
        async fn execute(&mut self, _command: &StorageCommand) -> Result<Value> {
            if self.break_next.swap(false, Ordering::SeqCst) {
                return Err(Error::Io("unexpected end of stream".into()));
            }
            self.running.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if let Ok(permit) = permit {
                permit.forget();
            }
            Ok(Value::ok())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_execute_against_memory_backend() {
        let pool = StoragePool::connect(Arc::new(MemoryBackend::new()), "memory", PoolConfig::default())
            .await
            .unwrap();
        assert_eq!(pool.size(), 10);
        assert_eq!(pool.live_connections(), 10);

        let set = StorageCommand::new("SET", Bytes::from_static(b"k"), vec![Bytes::from_static(b"v")]);
        assert_eq!(pool.execute(set).await.unwrap(), Value::ok());
        assert_eq!(pool.execute(get(b"k")).await.unwrap(), Value::str("v"));
    }

    #[tokio::test]
    async fn test_connect_is_all_or_nothing() {
        let backend = Arc::new(GatedBackend {
            fail_connect_at: Some(2),
            ..GatedBackend::new()
        });
        let result = StoragePool::connect(backend.clone(), "gated", PoolConfig::default().with_size(5)).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(backend.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fourth_caller_waits_for_free_connection() {
        let backend = Arc::new(GatedBackend::new());
        let pool = Arc::new(
            StoragePool::connect(backend.clone(), "gated", PoolConfig::default().with_size(3))
                .await
                .unwrap(),
        );

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.execute(get(b"k")).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.running.load(Ordering::SeqCst), 3);
        assert_eq!(calls.iter().filter(|c| c.is_finished()).count(), 0);

        // Free one connection: exactly one call finishes and the fourth starts
        backend.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.iter().filter(|c| c.is_finished()).count(), 1);
        assert_eq!(backend.running.load(Ordering::SeqCst), 3);

        backend.gate.add_permits(3);
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), Value::ok());
        }
    }

    #[tokio::test]
    async fn test_timeout_when_connection_busy() {
        let backend = Arc::new(GatedBackend::new());
        let config = PoolConfig::default()
            .with_size(1)
            .with_timeout(Duration::from_millis(50));
        let pool = StoragePool::connect(backend, "gated", config).await.unwrap();

        assert_eq!(pool.execute(get(b"k")).await, Err(Error::StorageTimeout));
    }

    #[tokio::test]
    async fn test_lost_connection_is_resurrected() {
        let backend = Arc::new(GatedBackend::new());
        backend.gate.add_permits(100);
        let config = PoolConfig::default()
            .with_size(1)
            .with_reconnect_interval(Duration::from_millis(20));
        let pool = StoragePool::connect(backend.clone(), "gated", config).await.unwrap();

        backend.break_next.store(true, Ordering::SeqCst);
        assert_eq!(pool.execute(get(b"k")).await, Err(Error::StorageConnectionLost));

        // Queued until the worker has reconnected
        assert_eq!(pool.execute(get(b"k")).await.unwrap(), Value::ok());
        assert_eq!(pool.live_connections(), 1);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let pool = StoragePool::connect(Arc::new(MemoryBackend::new()), "memory", PoolConfig::default().with_size(2))
            .await
            .unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert!(pool.is_closed());
        assert_eq!(pool.live_connections(), 0);
        assert_eq!(pool.execute(get(b"k")).await, Err(Error::StorageClosed));
    }
}
