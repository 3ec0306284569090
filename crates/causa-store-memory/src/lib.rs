#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **causa-store-memory** – In-memory `KvStore`/`JobQueue`/`NotifyBus` backend.
//!
//! Fast, non-persistent storage suitable for tests and single-process use.
//! All data is lost when the process terminates; see `causa-store-sled` for
//! the durable driver.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use causa_store_core::{JobQueue, KvStore, Lease, NotifyBus, StorageError};
use causa_types::CausaHash;
use tokio::sync::{broadcast, Notify, RwLock};

const DEFAULT_BUFFER: usize = 1024;

struct QueueState {
    pending: VecDeque<CausaHash>,
    leases: HashMap<CausaHash, Instant>,
}

/// An in-memory, non-persistent store implementing all three causa store
/// traits over a single process's heap.
#[derive(Clone)]
pub struct MemoryStore {
    kv: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    queue: Arc<RwLock<QueueState>>,
    queue_notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    broadcast_tx: broadcast::Sender<CausaHash>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BUFFER);
        Self {
            kv: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(RwLock::new(QueueState {
                pending: VecDeque::new(),
                leases: HashMap::new(),
            })),
            queue_notify: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            broadcast_tx,
        }
    }

    /// Stop the queue: any blocked or future `claim()` calls return `Ok(None)`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue_notify.notify_waiters();
    }

    /// Number of distinct keys currently stored.
    pub async fn len(&self) -> usize {
        self.kv.read().await.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.kv.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.kv.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let mut map = self.kv.write().await;
        let current = map.get(key).cloned();
        if current == expected {
            map.insert(key.to_string(), new);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .kv
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put_many(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        let mut map = self.kv.write().await;
        for (key, value) in writes {
            map.insert(key, value);
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, op: CausaHash) -> Result<(), StorageError> {
        let mut state = self.queue.write().await;
        if !state.pending.contains(&op) && !state.leases.contains_key(&op) {
            state.pending.push_back(op);
        }
        drop(state);
        self.queue_notify.notify_one();
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Lease>, StorageError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            {
                let mut state = self.queue.write().await;
                if let Some(op) = state.pending.pop_front() {
                    state.leases.insert(op, Instant::now());
                    return Ok(Some(Lease { op }));
                }
            }
            self.queue_notify.notified().await;
        }
    }

    async fn heartbeat(&self, op: CausaHash) -> Result<(), StorageError> {
        let mut state = self.queue.write().await;
        if let Some(last_seen) = state.leases.get_mut(&op) {
            *last_seen = Instant::now();
            Ok(())
        } else {
            Err(StorageError::NotFound(op.to_hex()))
        }
    }

    async fn reclaim_stale(&self, staleness: Duration) -> Result<Vec<CausaHash>, StorageError> {
        let mut state = self.queue.write().await;
        let now = Instant::now();
        let stale: Vec<CausaHash> = state
            .leases
            .iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) >= staleness)
            .map(|(op, _)| *op)
            .collect();
        for op in &stale {
            state.leases.remove(op);
            state.pending.push_back(*op);
        }
        drop(state);
        if !stale.is_empty() {
            self.queue_notify.notify_waiters();
        }
        Ok(stale)
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        self.shutdown();
        Ok(())
    }
}

impl NotifyBus for MemoryStore {
    fn publish(&self, op: CausaHash) {
        let _ = self.broadcast_tx.send(op);
    }

    fn subscribe(&self) -> broadcast::Receiver<CausaHash> {
        self.broadcast_tx.subscribe()
    }
}
