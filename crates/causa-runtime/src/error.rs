//! Worker-local failure type, kept distinct from the domain [`ErrorRecord`]s
//! committed to the store: a `RuntimeError` means the worker itself could
//! not finish the attempt (scratch-dir I/O, store unavailable, a bug), not
//! that the operation's funsie failed in a well-defined way. Operations that
//! fail with a `RuntimeError` are left `Running` so the executor's
//! stale-claim reclaim eventually hands them to another worker.

use causa_graph::GraphError;
use causa_store_core::StorageError;

/// Failures internal to the worker, as opposed to domain failures captured
/// in an [`causa_types::ErrorRecord`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The graph layer failed to read or write a record.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The underlying store failed to service a read or write.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Scratch-directory setup, command spawn, or file I/O failed.
    #[error("scratch directory I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A funsie referenced a callable or generator name with no registered
    /// handler.
    #[error("no handler registered for {kind} {name:?}")]
    UnregisteredHandler {
        /// `"callable"` or `"generator"`.
        kind: &'static str,
        /// The unresolved registry name.
        name: String,
    },
    /// An operation or funsie hash the worker was handed does not resolve to
    /// a stored record.
    #[error("dangling reference: {0} not found")]
    DanglingReference(String),
}
