#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **causa-executor** – DAG traversal and scheduling for the causa workflow
//! engine.
//!
//! Given a set of target artifact hashes, [`Executor`] walks the provenance
//! graph backwards (reverse-BFS over `art:prod` and each operation's
//! `input_bindings`), discovers operations whose inputs are all terminal,
//! and enqueues them onto the job queue. It also blocks callers until their
//! targets become terminal ([`Executor::wait_for`]) and reclaims operations
//! whose worker died mid-execution. It never executes an operation itself —
//! that is `causa-runtime`'s job, one layer up.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use causa_graph::GraphError;
use causa_store_core::{JobQueue, KvStore, NotifyBus, Store, StorageError};
use causa_types::{ArtifactStatus, CausaHash, OperationStatus};

/// Default staleness threshold before a claimed-but-silent operation is
/// reclaimed and re-enqueued (15 minutes of no heartbeat by default).
pub const DEFAULT_RECLAIM_STALENESS: Duration = Duration::from_secs(15 * 60);

/// Default wait between readiness passes while blocked in [`Executor::wait_for`],
/// used as a fallback when the notification bus misses a wake-up (e.g. a
/// publish that raced a fresh subscription).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tunables for an [`Executor`] instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long a claimed operation may go without a heartbeat before it is
    /// reclaimed and re-enqueued for another worker.
    pub reclaim_staleness: Duration,
    /// Fallback poll interval used between notification-bus wake-ups.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { reclaim_staleness: DEFAULT_RECLAIM_STALENESS, poll_interval: DEFAULT_POLL_INTERVAL }
    }
}

/// Failures raised by the DAG executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The graph layer failed to read or write a record.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The underlying store failed to service a read or write.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A hash encountered during traversal does not resolve to a known
    /// operation or artifact record.
    #[error("unknown entity {0} encountered during traversal")]
    Unknown(CausaHash),
}

/// Final state of one target artifact after [`Executor::execute`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    /// The artifact resolved to `Ready` bytes.
    Ready,
    /// The artifact resolved to `Error` (possibly propagated from upstream).
    Error,
}

/// The result of blocking on a set of targets until they are all terminal.
#[derive(Debug, Clone)]
pub struct ExecuteReport {
    /// Per-target terminal outcome, in the same order the targets were given.
    pub outcomes: Vec<(CausaHash, TargetOutcome)>,
}

impl ExecuteReport {
    /// Whether every target ended `Ready` (the CLI's `execute` exit-code
    /// contract: 0 if all targets end ready, 1 if any ends error).
    pub fn all_ready(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| *outcome == TargetOutcome::Ready)
    }
}

/// Diagnostic summary of a traversal, used by the `graph` CLI subcommand and
/// by tests asserting that a second execute performs zero new work.
#[derive(Debug, Clone, Default)]
pub struct DependencyAnalysis {
    /// Distinct operations reachable from the targets.
    pub total_operations: usize,
    /// Of those, how many were already terminal (`Done`/`Error`) before this
    /// traversal ran — i.e. cache hits that require no execution.
    pub cache_hits: usize,
    /// Longest chain of operation-to-input-artifact hops from any target.
    pub max_depth: usize,
}

/// The DAG traversal and scheduling engine.
///
/// Stateless beyond its `store` handle: all durable state (queue contents,
/// operation/artifact status) lives in the shared store, so any number of
/// `Executor` instances (one per CLI invocation, one embedded in each
/// worker, ...) can drive the same workflow concurrently without
/// coordinating with each other directly.
pub struct Executor {
    store: Arc<dyn Store>,
    config: ExecutorConfig,
}

impl Executor {
    /// Build an executor over a shared store.
    pub fn new(store: Arc<dyn Store>, config: ExecutorConfig) -> Self {
        Self { store, config }
    }

    /// Run one readiness pass and return without waiting for completion —
    /// the "please produce these, asynchronously" half of `execute`.
    #[tracing::instrument(skip(self))]
    pub async fn submit(&self, targets: &[CausaHash]) -> Result<(), ExecutorError> {
        self.readiness_pass(targets).await
    }

    /// Reverse-BFS from `targets` over `art:prod` and each operation's
    /// `input_bindings`. Enqueues every `Pending` operation
    /// reachable whose inputs are all terminal; operations still waiting on
    /// an upstream result have their own inputs pushed onto the frontier so
    /// the walk continues backwards through the graph.
    #[tracing::instrument(skip(self))]
    pub async fn readiness_pass(&self, targets: &[CausaHash]) -> Result<(), ExecutorError> {
        let store = self.store.as_ref();
        let mut frontier: VecDeque<CausaHash> = targets.iter().copied().collect();
        let mut visited_artifacts: HashSet<CausaHash> = HashSet::new();
        let mut visited_ops: HashSet<CausaHash> = HashSet::new();

        while let Some(artifact_hash) = frontier.pop_front() {
            if !visited_artifacts.insert(artifact_hash) {
                continue;
            }
            let (resolved, status) = causa_graph::resolve_linked(store, artifact_hash).await?;
            match status {
                // Terminal already: nothing to schedule, this branch of the
                // walk is a cache hit.
                Some(ArtifactStatus::Ready) | Some(ArtifactStatus::Error) => continue,
                Some(ArtifactStatus::Unresolved) => {
                    let Some(op_hash) = self.producing_op(resolved).await? else { continue };
                    if !visited_ops.insert(op_hash) {
                        continue;
                    }
                    match causa_graph::operation_status(store, op_hash).await? {
                        Some(OperationStatus::Pending) => {
                            let operation = causa_graph::get_operation(store, op_hash)
                                .await?
                                .ok_or(ExecutorError::Unknown(op_hash))?;
                            if causa_graph::operation_inputs_terminal(store, &operation).await? {
                                self.store.enqueue(op_hash).await?;
                                tracing::debug!(op = %op_hash, "readiness pass enqueued operation");
                            } else {
                                frontier.extend(operation.input_bindings.values().copied());
                            }
                        }
                        // Running: a worker already has it, nothing to do.
                        // Done/Error: its outputs will transition terminal
                        // (or already have); a later pass or notification
                        // picks that up.
                        Some(OperationStatus::Running)
                        | Some(OperationStatus::Done)
                        | Some(OperationStatus::Error)
                        | None => {}
                    }
                }
                Some(ArtifactStatus::Linked(_)) => unreachable!("resolve_linked always follows through Linked"),
                None => {}
            }
        }
        Ok(())
    }

    /// The operation hash that produces `artifact`, or `None` for a constant
    /// artifact (which is always `Ready` and never reaches this branch in
    /// practice) or an artifact the store has never heard of.
    async fn producing_op(&self, artifact: CausaHash) -> Result<Option<CausaHash>, ExecutorError> {
        let key = causa_graph::art_prod_key(artifact);
        match self.store.get(&key).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if text == "const" {
                    Ok(None)
                } else {
                    text.parse::<CausaHash>().map(Some).map_err(|_| ExecutorError::Unknown(artifact))
                }
            }
            None => Ok(None),
        }
    }

    /// Block until every target in `targets` reaches a terminal status,
    /// repeating readiness passes and stale-claim reclamation on each
    /// notification (or fallback poll tick).
    #[tracing::instrument(skip(self))]
    pub async fn wait_for(&self, targets: &[CausaHash]) -> Result<ExecuteReport, ExecutorError> {
        let mut wake = self.store.subscribe();
        loop {
            self.readiness_pass(targets).await?;
            let reclaimed = self.store.reclaim_stale(self.config.reclaim_staleness).await?;
            for op in &reclaimed {
                tracing::info!(op = %op, "reclaimed stale operation claim");
            }

            let mut outcomes = Vec::with_capacity(targets.len());
            let mut all_terminal = true;
            for &target in targets {
                let (_, status) = causa_graph::resolve_linked(self.store.as_ref(), target).await?;
                match status {
                    Some(ArtifactStatus::Ready) => outcomes.push((target, TargetOutcome::Ready)),
                    Some(ArtifactStatus::Error) => outcomes.push((target, TargetOutcome::Error)),
                    _ => {
                        all_terminal = false;
                        break;
                    }
                }
            }
            if all_terminal {
                return Ok(ExecuteReport { outcomes });
            }

            let _ = tokio::time::timeout(self.config.poll_interval, wake.recv()).await;
        }
    }

    /// Submit and block until all targets are terminal — the user-facing
    /// `execute(targets)` contract.
    pub async fn execute(&self, targets: &[CausaHash]) -> Result<ExecuteReport, ExecutorError> {
        self.submit(targets).await?;
        self.wait_for(targets).await
    }

    /// Diagnostic traversal: how many operations are reachable from
    /// `targets`, how many are already terminal, and how deep the chain
    /// runs. Used by the `graph` CLI subcommand and by tests asserting a
    /// replay performs zero new executions.
    #[tracing::instrument(skip(self))]
    pub async fn analyze(&self, targets: &[CausaHash]) -> Result<DependencyAnalysis, ExecutorError> {
        let store = self.store.as_ref();
        let mut frontier: VecDeque<(CausaHash, usize)> = targets.iter().map(|h| (*h, 0)).collect();
        let mut visited_artifacts = HashSet::new();
        let mut visited_ops = HashSet::new();
        let mut cache_hits = 0usize;
        let mut max_depth = 0usize;

        while let Some((artifact_hash, depth)) = frontier.pop_front() {
            if !visited_artifacts.insert(artifact_hash) {
                continue;
            }
            max_depth = max_depth.max(depth);
            // Look the producing op up by the *declared* output hash, not
            // the hash `resolve_linked` redirects to: `art:prod` is written
            // once, at `put_operation` time, keyed by the artifact the
            // operation declared it would produce. A completed operation's
            // output is `Linked` to a deduplicated content hash whose own
            // `art:prod` is `"const"` — resolving first would make every
            // finished operation invisible to this diagnostic.
            let (_, status) = causa_graph::resolve_linked(store, artifact_hash).await?;
            let Some(op_hash) = self.producing_op(artifact_hash).await? else { continue };
            if !visited_ops.insert(op_hash) {
                continue;
            }
            if matches!(status, Some(ArtifactStatus::Ready) | Some(ArtifactStatus::Error)) {
                cache_hits += 1;
            }
            if let Some(operation) = causa_graph::get_operation(store, op_hash).await? {
                frontier.extend(operation.input_bindings.values().map(|h| (*h, depth + 1)));
            }
        }
        Ok(DependencyAnalysis { total_operations: visited_ops.len(), cache_hits, max_depth })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causa_store_memory::MemoryStore;
    use causa_types::{Encoding, ErrorKind, ErrorRecord, Funsie, FunsieKind, Operation, Slot};
    use std::collections::BTreeMap;

    fn slot(name: &str) -> Slot {
        Slot::strict(name, Encoding::RawBytes)
    }

    /// Stand-in for a worker: claims the next job and immediately marks it
    /// `Done` with the given output bytes, without invoking any real
    /// execution logic. Exercises the executor's scheduling in isolation
    /// from `causa-runtime`.
    async fn run_fake_worker_once(store: &MemoryStore, outputs: &[(&str, &[u8])]) {
        let lease = store.claim().await.unwrap().unwrap();
        let operation: Operation = causa_graph::get_operation(store, lease.op).await.unwrap().unwrap();
        for (name, bytes) in outputs {
            let out_hash = operation.output_bindings[*name];
            let data_key = causa_graph::art_data_key(out_hash);
            store.put(&data_key, bytes.to_vec()).await.unwrap();
            causa_graph::transition_artifact(store, out_hash, ArtifactStatus::Ready).await.unwrap();
        }
        store
            .put(&causa_graph::op_status_key(lease.op), serde_json::to_vec(&OperationStatus::Done).unwrap())
            .await
            .unwrap();
        store.publish(lease.op);
    }

    /// Stand-in for a worker that commits the way `causa-runtime` actually
    /// does: each output is written under its *content* hash and the
    /// declared output artifact is redirected via `ArtifactStatus::Linked`,
    /// not marked `Ready` directly.
    async fn run_fake_worker_once_with_dedup(store: &MemoryStore, outputs: &[(&str, &[u8])]) {
        let lease = store.claim().await.unwrap().unwrap();
        let operation: Operation = causa_graph::get_operation(store, lease.op).await.unwrap().unwrap();
        for (name, bytes) in outputs {
            let declared_hash = operation.output_bindings[*name];
            let content_hash = causa_graph::put_const_artifact(store, Encoding::RawBytes, bytes.to_vec()).await.unwrap();
            causa_graph::transition_artifact(store, declared_hash, ArtifactStatus::Linked(content_hash)).await.unwrap();
        }
        store
            .put(&causa_graph::op_status_key(lease.op), serde_json::to_vec(&OperationStatus::Done).unwrap())
            .await
            .unwrap();
        store.publish(lease.op);
    }

    #[tokio::test]
    async fn readiness_pass_enqueues_operation_with_ready_inputs() {
        let store = Arc::new(MemoryStore::new());
        let input = causa_graph::put_const_artifact(store.as_ref(), Encoding::RawBytes, b"hi".to_vec()).await.unwrap();
        let funsie = Funsie {
            kind: FunsieKind::Shell(vec!["cat in.txt".into()]),
            inputs: vec![slot("in.txt")],
            outputs: vec![slot("stdout0")],
            extra: None,
        };
        let fh = causa_graph::put_funsie(store.as_ref(), funsie.clone()).await.unwrap();
        let mut bindings = BTreeMap::new();
        bindings.insert("in.txt".to_string(), input);
        let (_, operation) = causa_graph::put_operation(store.as_ref(), fh, bindings, &funsie.outputs).await.unwrap();
        let target = operation.output_bindings["stdout0"];

        let executor = Executor::new(store.clone(), ExecutorConfig::default());
        executor.submit(&[target]).await.unwrap();

        let lease = store.claim().await.unwrap().unwrap();
        assert_eq!(lease.op, causa_graph::operation_hash(fh, &operation.input_bindings).unwrap());
    }

    #[tokio::test]
    async fn wait_for_blocks_until_worker_commits() {
        let store = Arc::new(MemoryStore::new());
        let input = causa_graph::put_const_artifact(store.as_ref(), Encoding::RawBytes, b"hi".to_vec()).await.unwrap();
        let funsie = Funsie {
            kind: FunsieKind::Shell(vec!["cat in.txt".into()]),
            inputs: vec![slot("in.txt")],
            outputs: vec![slot("stdout0")],
            extra: None,
        };
        let fh = causa_graph::put_funsie(store.as_ref(), funsie.clone()).await.unwrap();
        let mut bindings = BTreeMap::new();
        bindings.insert("in.txt".to_string(), input);
        let (_, operation) = causa_graph::put_operation(store.as_ref(), fh, bindings, &funsie.outputs).await.unwrap();
        let target = operation.output_bindings["stdout0"];

        let executor = Executor::new(store.clone(), ExecutorConfig::default());
        executor.submit(&[target]).await.unwrap();

        let worker_store = store.clone();
        let worker = tokio::spawn(async move {
            run_fake_worker_once(&worker_store, &[("stdout0", b"hi")]).await;
        });

        let report = executor.wait_for(&[target]).await.unwrap();
        worker.await.unwrap();
        assert!(report.all_ready());
    }

    #[tokio::test]
    async fn second_execute_performs_zero_new_claims() {
        let store = Arc::new(MemoryStore::new());
        let input = causa_graph::put_const_artifact(store.as_ref(), Encoding::RawBytes, b"hi".to_vec()).await.unwrap();
        let funsie = Funsie {
            kind: FunsieKind::Shell(vec!["cat in.txt".into()]),
            inputs: vec![slot("in.txt")],
            outputs: vec![slot("stdout0")],
            extra: None,
        };
        let fh = causa_graph::put_funsie(store.as_ref(), funsie.clone()).await.unwrap();
        let mut bindings = BTreeMap::new();
        bindings.insert("in.txt".to_string(), input);
        let (_, operation) = causa_graph::put_operation(store.as_ref(), fh, bindings, &funsie.outputs).await.unwrap();
        let target = operation.output_bindings["stdout0"];

        let executor = Executor::new(store.clone(), ExecutorConfig::default());
        executor.submit(&[target]).await.unwrap();
        run_fake_worker_once(&store, &[("stdout0", b"hi")]).await;

        let analysis_before = executor.analyze(&[target]).await.unwrap();
        assert_eq!(analysis_before.cache_hits, 1);

        // A second submit must not re-enqueue: the operation is Done.
        executor.submit(&[target]).await.unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(20), store.claim()).await;
        assert!(nothing.is_err(), "claim should have blocked — nothing new was enqueued");
    }

    #[tokio::test]
    async fn analyze_counts_a_completed_operation_committed_via_dedup_linking() {
        // The real runtime never marks a declared output `Ready` directly —
        // it writes the bytes under their content hash and redirects the
        // declared artifact via `Linked` (see `Worker::write_back_output`).
        // `analyze` must still find and count the producing operation.
        let store = Arc::new(MemoryStore::new());
        let input = causa_graph::put_const_artifact(store.as_ref(), Encoding::RawBytes, b"hi".to_vec()).await.unwrap();
        let funsie = Funsie {
            kind: FunsieKind::Shell(vec!["cat in.txt".into()]),
            inputs: vec![slot("in.txt")],
            outputs: vec![slot("stdout0")],
            extra: None,
        };
        let fh = causa_graph::put_funsie(store.as_ref(), funsie.clone()).await.unwrap();
        let mut bindings = BTreeMap::new();
        bindings.insert("in.txt".to_string(), input);
        let (_, operation) = causa_graph::put_operation(store.as_ref(), fh, bindings, &funsie.outputs).await.unwrap();
        let target = operation.output_bindings["stdout0"];

        let executor = Executor::new(store.clone(), ExecutorConfig::default());
        executor.submit(&[target]).await.unwrap();
        run_fake_worker_once_with_dedup(&store, &[("stdout0", b"hi")]).await;

        let analysis = executor.analyze(&[target]).await.unwrap();
        assert_eq!(analysis.total_operations, 1);
        assert_eq!(analysis.cache_hits, 1);
    }

    #[tokio::test]
    async fn error_propagation_short_circuits_downstream_without_executing() {
        let store = Arc::new(MemoryStore::new());
        let input = causa_graph::put_const_artifact(store.as_ref(), Encoding::RawBytes, b"x".to_vec()).await.unwrap();
        let upstream_funsie = Funsie {
            kind: FunsieKind::Shell(vec!["exit 1".into()]),
            inputs: vec![slot("in")],
            outputs: vec![slot("x")],
            extra: None,
        };
        let ufh = causa_graph::put_funsie(store.as_ref(), upstream_funsie.clone()).await.unwrap();
        let mut ub = BTreeMap::new();
        ub.insert("in".to_string(), input);
        let (upstream_op, upstream) = causa_graph::put_operation(store.as_ref(), ufh, ub, &upstream_funsie.outputs).await.unwrap();
        let failing_output = upstream.output_bindings["x"];

        let downstream_funsie = Funsie {
            kind: FunsieKind::Callable { name: "noop".into() },
            inputs: vec![slot("x")],
            outputs: vec![slot("y")],
            extra: None,
        };
        let dfh = causa_graph::put_funsie(store.as_ref(), downstream_funsie.clone()).await.unwrap();
        let mut db = BTreeMap::new();
        db.insert("x".to_string(), failing_output);
        let (_, downstream) = causa_graph::put_operation(store.as_ref(), dfh, db, &downstream_funsie.outputs).await.unwrap();
        let target = downstream.output_bindings["y"];

        let executor = Executor::new(store.clone(), ExecutorConfig::default());
        executor.submit(&[target]).await.unwrap();

        // The downstream op's input is not yet terminal, so it must not be queued.
        let nothing = tokio::time::timeout(Duration::from_millis(20), store.claim()).await;
        assert!(nothing.is_err());

        // Mark upstream as failed directly (as the runtime's commit step would).
        let record = ErrorRecord::new(ErrorKind::NonzeroExit, upstream_op, "exit 1");
        store.put(&causa_graph::art_err_key(failing_output), serde_json::to_vec(&record).unwrap()).await.unwrap();
        causa_graph::transition_artifact(store.as_ref(), failing_output, ArtifactStatus::Error).await.unwrap();
        store
            .put(&causa_graph::op_status_key(upstream_op), serde_json::to_vec(&OperationStatus::Error).unwrap())
            .await
            .unwrap();

        executor.submit(&[target]).await.unwrap();
        let lease = store.claim().await.unwrap().unwrap();
        assert_eq!(lease.op, causa_graph::operation_hash(dfh, &downstream.input_bindings).unwrap());
    }
}
