#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **causa-store-sled** – Durable `sled`-backed `KvStore`/`JobQueue`/`NotifyBus`.
//!
//! Persists the engine's content-addressed keyspace to disk with sled's ACID
//! transactions, so a worker fleet survives process restarts without losing
//! provenance. A tree per logical namespace (open/open_with_config/temporary
//! constructors), a broadcast channel for live updates, same trait surface
//! as the in-memory backend.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use causa_store_core::{JobQueue, KvStore, Lease, NotifyBus, StorageError};
use causa_types::CausaHash;
use sled::Db;
use tokio::sync::{broadcast, Notify};

const DEFAULT_BROADCAST_SIZE: usize = 1024;
const SHUTDOWN_KEY: &str = "queue:shutdown";

fn backend_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// A persistent `KvStore`/`JobQueue`/`NotifyBus` backend built on sled.
///
/// Three trees share one database: `kv` holds the causal-hash keyspace
/// (`funsie:`, `op:`, `art:`, ...), `queue_pending` holds the FIFO of
/// enqueued operation hashes, and `queue_leases` holds claimed jobs' last
/// heartbeat timestamp. Notifications are in-process only (a
/// `tokio::sync::broadcast` channel): a worker that restarts falls back to
/// the bounded poll the executor already performs.
pub struct SledStore {
    _db: Db,
    kv: sled::Tree,
    queue_pending: sled::Tree,
    queue_leases: sled::Tree,
    queue_notify: Notify,
    broadcast_tx: broadcast::Sender<CausaHash>,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(backend_err)?;
        Self::from_db(db)
    }

    /// Build a store from an already-open sled database.
    pub fn from_db(db: Db) -> Result<Self, StorageError> {
        let kv = db.open_tree("kv").map_err(backend_err)?;
        let queue_pending = db.open_tree("queue_pending").map_err(backend_err)?;
        let queue_leases = db.open_tree("queue_leases").map_err(backend_err)?;
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Ok(Self {
            _db: db,
            kv,
            queue_pending,
            queue_leases,
            queue_notify: Notify::new(),
            broadcast_tx,
        })
    }

    /// Open a temporary, self-cleaning database — used by tests.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open().map_err(backend_err)?;
        Self::from_db(db)
    }

    /// Flush both trees to disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.kv.flush_async().await.map_err(backend_err)?;
        self.queue_pending.flush_async().await.map_err(backend_err)?;
        self.queue_leases.flush_async().await.map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.kv.get(key.as_bytes()).map_err(backend_err)?.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.kv.insert(key.as_bytes(), value).map_err(backend_err)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let result = self.kv.compare_and_swap(key.as_bytes(), expected, Some(new));
        match result.map_err(backend_err)? {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        for entry in self.kv.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(backend_err)?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }

    async fn put_many(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        self.kv
            .transaction(|tx| {
                for (key, value) in &writes {
                    tx.insert(key.as_bytes(), value.clone())?;
                }
                Ok::<_, sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(backend_err)?;
        Ok(())
    }
}

fn encode_hash(op: CausaHash) -> Vec<u8> {
    op.as_bytes().to_vec()
}

fn decode_hash(bytes: &[u8]) -> Result<CausaHash, StorageError> {
    let arr: [u8; causa_types::HASH_LEN] = bytes
        .try_into()
        .map_err(|_| StorageError::DeserializationFailed("malformed op hash key".into()))?;
    Ok(CausaHash::new(arr))
}

fn now_millis() -> Result<u64, StorageError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| backend_err(e))
}

#[async_trait]
impl JobQueue for SledStore {
    async fn enqueue(&self, op: CausaHash) -> Result<(), StorageError> {
        let key = encode_hash(op);
        if self.queue_leases.contains_key(&key).map_err(backend_err)? {
            return Ok(());
        }
        // Pending entries are keyed by hash too, so re-enqueuing is a no-op.
        self.queue_pending.insert(&key, &[][..]).map_err(backend_err)?;
        self.queue_notify.notify_one();
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Lease>, StorageError> {
        loop {
            if self.kv.contains_key(SHUTDOWN_KEY.as_bytes()).map_err(backend_err)? {
                return Ok(None);
            }
            if let Some((key, _)) = self.queue_pending.pop_min().map_err(backend_err)? {
                let op = decode_hash(&key)?;
                let ts = now_millis()?.to_be_bytes();
                self.queue_leases.insert(&key, &ts).map_err(backend_err)?;
                return Ok(Some(Lease { op }));
            }
            let notified = self.queue_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    async fn heartbeat(&self, op: CausaHash) -> Result<(), StorageError> {
        let key = encode_hash(op);
        if !self.queue_leases.contains_key(&key).map_err(backend_err)? {
            return Err(StorageError::NotFound(op.to_hex()));
        }
        let ts = now_millis()?.to_be_bytes();
        self.queue_leases.insert(&key, &ts).map_err(backend_err)?;
        Ok(())
    }

    async fn reclaim_stale(&self, staleness: Duration) -> Result<Vec<CausaHash>, StorageError> {
        let now = now_millis()?;
        let mut reclaimed = Vec::new();
        for entry in self.queue_leases.iter() {
            let (key, ts_bytes) = entry.map_err(backend_err)?;
            let ts = u64::from_be_bytes(
                ts_bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::DeserializationFailed("malformed lease timestamp".into()))?,
            );
            if now.saturating_sub(ts) >= staleness.as_millis() as u64 {
                let op = decode_hash(&key)?;
                self.queue_leases.remove(&key).map_err(backend_err)?;
                self.queue_pending.insert(&key, &[][..]).map_err(backend_err)?;
                reclaimed.push(op);
            }
        }
        if !reclaimed.is_empty() {
            self.queue_notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        self.kv.insert(SHUTDOWN_KEY.as_bytes(), &[1u8][..]).map_err(backend_err)?;
        self.queue_notify.notify_waiters();
        Ok(())
    }
}

impl NotifyBus for SledStore {
    fn publish(&self, op: CausaHash) {
        let _ = self.broadcast_tx.send(op);
    }

    fn subscribe(&self) -> broadcast::Receiver<CausaHash> {
        self.broadcast_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> CausaHash {
        CausaHash::new([byte; causa_types::HASH_LEN])
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = SledStore::temporary().unwrap();
        store.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_mismatch() {
        let store = SledStore::temporary().unwrap();
        store.put("k", b"v1".to_vec()).await.unwrap();
        let ok = store
            .compare_and_swap("k", Some(b"wrong".to_vec()), b"v2".to_vec())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn put_many_is_transactional() {
        let store = SledStore::temporary().unwrap();
        store
            .put_many(vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec()),
            ])
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn enqueue_then_claim_returns_job() {
        let store = SledStore::temporary().unwrap();
        store.enqueue(hash(1)).await.unwrap();
        let lease = store.claim().await.unwrap().unwrap();
        assert_eq!(lease.op, hash(1));
    }

    #[tokio::test]
    async fn reclaim_stale_requeues_expired_leases() {
        let store = SledStore::temporary().unwrap();
        store.enqueue(hash(3)).await.unwrap();
        let lease = store.claim().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reclaimed = store.reclaim_stale(Duration::from_millis(5)).await.unwrap();
        assert_eq!(reclaimed, vec![lease.op]);
        let release = store.claim().await.unwrap().unwrap();
        assert_eq!(release.op, lease.op);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = SledStore::temporary().unwrap();
        let mut rx = store.subscribe();
        store.publish(hash(5));
        assert_eq!(rx.recv().await.unwrap(), hash(5));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("causa.db");
        {
            let store = SledStore::open(&db_path).unwrap();
            store.put("k", b"v".to_vec()).await.unwrap();
            store.flush().await.unwrap();
        }
        {
            let store = SledStore::open(&db_path).unwrap();
            assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        }
    }
}
