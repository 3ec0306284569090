#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **causa-store-core** – Core storage abstractions for the causa workflow engine.
//!
//! This crate defines the contracts every KV-store backend must satisfy
//! ([`KvStore`], [`JobQueue`], [`NotifyBus`]) plus the canonical-encoding and
//! causal-hashing helpers the graph layer uses to derive content addresses.
//! It provides no concrete storage — see `causa-store-memory` and
//! `causa-store-sled` for the in-memory and durable drivers.

use std::time::Duration;

use async_trait::async_trait;
use causa_types::CausaHash;
use serde::Serialize;
use tokio::sync::broadcast;

//─────────────────────────────
//  Canonical encoding & hashing
//─────────────────────────────

/// Recursively encode a JSON value using the engine's canonical byte layout:
/// object keys in ascending order, arrays in declaration order, integers as
/// fixed-width big-endian `i64`/`f64`, strings length-prefixed UTF-8.
///
/// Canonical encoding (not `serde_json`'s own, non-contractual map order, and
/// not `rmp-serde`'s) is what gets causal-hashed, so two logically identical
/// entities always produce identical bytes regardless of field declaration
/// order in the source struct.
pub fn canonical_encode(value: &serde_json::Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(value, &mut out);
    out
}

fn encode_value(value: &serde_json::Value, out: &mut Vec<u8>) {
    match value {
        serde_json::Value::Null => out.push(0),
        serde_json::Value::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        serde_json::Value::Number(n) => {
            out.push(2);
            if let Some(i) = n.as_i64() {
                out.push(0);
                out.extend_from_slice(&i.to_be_bytes());
            } else {
                out.push(1);
                out.extend_from_slice(&n.as_f64().unwrap_or(0.0).to_be_bytes());
            }
        }
        serde_json::Value::String(s) => {
            out.push(3);
            out.extend_from_slice(&(s.len() as u64).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        serde_json::Value::Array(items) => {
            out.push(4);
            out.extend_from_slice(&(items.len() as u64).to_be_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            out.push(5);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.extend_from_slice(&(keys.len() as u64).to_be_bytes());
            for key in keys {
                out.extend_from_slice(&(key.len() as u64).to_be_bytes());
                out.extend_from_slice(key.as_bytes());
                encode_value(&map[key], out);
            }
        }
    }
}

/// Canonically encode a serializable value to bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_value(value)
        .map_err(|e| StorageError::SerializationFailed(e.to_string()))?;
    Ok(canonical_encode(&json))
}

/// Truncated BLAKE3 hash of canonical bytes, chained with zero or more parent
/// hashes so identity depends on causal lineage, not just local content.
///
/// Parent hashes are sorted before mixing so the result does not depend on
/// the order they are supplied in.
pub fn causal_hash(bytes: &[u8], parents: &[CausaHash]) -> CausaHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    let mut sorted: Vec<&CausaHash> = parents.iter().collect();
    sorted.sort();
    for parent in sorted {
        hasher.update(parent.as_bytes());
    }
    let digest = hasher.finalize();
    let mut truncated = [0u8; causa_types::HASH_LEN];
    truncated.copy_from_slice(&digest.as_bytes()[..causa_types::HASH_LEN]);
    CausaHash::new(truncated)
}

/// Hash a serializable value with no causal parents — used for constant
/// artifacts, whose identity is purely content-derived.
pub fn content_hash<T: Serialize>(value: &T) -> Result<CausaHash, StorageError> {
    Ok(causal_hash(&canonical_bytes(value)?, &[]))
}

//─────────────────────────────
//  KV store
//─────────────────────────────

/// Minimal key-value contract the graph and executor layers are built on.
///
/// Every mutation that must be visible atomically to every worker goes
/// through [`KvStore::compare_and_swap`] — backends are free to implement it
/// with a mutex, an optimistic retry loop, or a native transaction API, as
/// long as no two successful swaps on the same key ever interleave.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the current bytes stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Unconditionally store `value` at `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Atomically replace the bytes at `key` with `new`, but only if the
    /// current bytes equal `expected` (`None` means "key must be absent").
    /// Returns `Ok(true)` if the swap took effect, `Ok(false)` if `expected`
    /// did not match (no changes were made).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool, StorageError>;

    /// List all keys sharing the given prefix. Used for hash-prefix lookup
    /// and for the `graph` CLI subcommand's traversal.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Write several key/value pairs as a single atomic script: either every
    /// write lands or none do. Backends implement this with a transaction
    /// (sled) or a single critical section (in-memory); it is the
    /// multi-key-script primitive the graph layer uses for `put_operation`
    /// and `put_const_artifact`, where several keys derived from one hash
    /// must appear together.
    async fn put_many(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError>;
}

//─────────────────────────────
//  Job queue
//─────────────────────────────

/// A claimed job's lease bookkeeping, returned by [`JobQueue::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// The claimed operation's hash.
    pub op: CausaHash,
}

/// Minimal work-queue contract backing the worker fleet's job distribution.
///
/// `claim` must be exactly-once-effective: if two workers race to claim the
/// same pending job, only one may succeed — backends implement this with a
/// compare-and-swap on the operation's status key, not queue-level locking.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue an operation hash for execution. Idempotent: enqueuing an
    /// already-queued or already-claimed operation is a no-op.
    async fn enqueue(&self, op: CausaHash) -> Result<(), StorageError>;

    /// Claim the next available job, blocking until one is enqueued or the
    /// queue is shut down (in which case `Ok(None)` is returned).
    async fn claim(&self) -> Result<Option<Lease>, StorageError>;

    /// Refresh a claimed job's staleness timer so reclaim logic does not
    /// treat a slow-but-alive worker as crashed.
    async fn heartbeat(&self, op: CausaHash) -> Result<(), StorageError>;

    /// Re-enqueue any claimed jobs whose last heartbeat is older than
    /// `staleness`, returning the reclaimed operation hashes.
    async fn reclaim_stale(&self, staleness: Duration) -> Result<Vec<CausaHash>, StorageError>;

    /// Signal the queue to drain: every blocked or future `claim()` call,
    /// in this process or any other sharing the same backing store, returns
    /// `Ok(None)` from this point on. Already-enqueued-but-unclaimed jobs
    /// are left pending for a future run; this is a drain signal, not a
    /// purge. Backs the `causa shutdown` CLI command.
    async fn shutdown(&self) -> Result<(), StorageError>;
}

//─────────────────────────────
//  Notification bus
//─────────────────────────────

/// Pub/sub notification used by the executor to wake blocked `wait_for`
/// callers as soon as an operation reaches a terminal status, instead of
/// polling the KV store.
pub trait NotifyBus: Send + Sync {
    /// Announce that `op` has reached a terminal status.
    fn publish(&self, op: CausaHash);

    /// Subscribe to terminal-status announcements.
    fn subscribe(&self) -> broadcast::Receiver<CausaHash>;
}

/// Convenience bundle of the three store contracts a worker or executor
/// needs at once. Any backend implementing all three traits gets this for
/// free, so callers can hold a single `Arc<dyn Store>` instead of three.
pub trait Store: KvStore + JobQueue + NotifyBus {}
impl<T: KvStore + JobQueue + NotifyBus> Store for T {}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures a [`KvStore`]/[`JobQueue`] implementation can surface.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A value failed to serialize into canonical bytes.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    /// A value failed to deserialize from stored bytes.
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    /// The underlying backend (sled, disk, etc.) reported an error.
    #[error("backend error: {0}")]
    Backend(String),
    /// A write attempted to change bytes already committed under a
    /// content-addressed key. Always fatal — never retried.
    #[error("hash collision at key {key}: existing content differs from new write")]
    HashCollision {
        /// The key at which the collision was detected.
        key: String,
    },
    /// The requested key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),
}
