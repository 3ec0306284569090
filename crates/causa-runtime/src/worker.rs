//! The claim/execute/commit loop a worker process drives against the shared
//! store. There is no agent identity here, only the operation a worker
//! currently holds the lease on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use causa_graph::GraphError;
use causa_store_core::Store;
use causa_types::{ArtifactStatus, CausaHash, ErrorKind, ErrorRecord, Funsie, FunsieKind, Operation, OperationStatus};
use tokio::sync::watch;

use crate::config::WorkerConfig;
use crate::dispatch::{dispatch_callable, dispatch_shell, dispatch_subdag, DispatchFailure, DispatchOutcome};
use crate::error::RuntimeError;
use crate::registry::{CallableInput, CallableRegistry, GeneratorRegistry};

/// Resolved inputs for one execution attempt, or a short-circuit signal that
/// a strict input was itself in error (see the strict-vs-
/// non-strict dispatch").
enum ResolvedInputs {
    Ready(BTreeMap<String, CallableInput>),
    UpstreamError(ErrorRecord),
}

/// Drives the claim/execute/commit loop against a shared store.
pub struct Worker {
    store: Arc<dyn Store>,
    config: WorkerConfig,
    callables: Arc<CallableRegistry>,
    generators: Arc<GeneratorRegistry>,
}

impl Worker {
    /// Build a worker over a shared store and the registries its funsies may
    /// reference.
    pub fn new(
        store: Arc<dyn Store>,
        config: WorkerConfig,
        callables: Arc<CallableRegistry>,
        generators: Arc<GeneratorRegistry>,
    ) -> Self {
        Self { store, config, callables, generators }
    }

    /// Claim and execute operations until `shutdown` is signalled or the
    /// queue itself is shut down (`claim` returning `None`).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RuntimeError> {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("worker shutting down");
                        return Ok(());
                    }
                }
                claimed = self.store.claim() => {
                    match claimed? {
                        Some(lease) => {
                            if let Err(e) = self.execute_operation(lease.op).await {
                                tracing::warn!(op = %lease.op, error = %e, "attempt failed, leaving claim for reclaim");
                            }
                        }
                        None => {
                            tracing::info!("job queue shut down");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Execute one claimed operation end to end: resolve inputs, dispatch by
    /// funsie kind (with a heartbeat ticker and an optional timeout), and
    /// commit the result.
    #[tracing::instrument(skip(self))]
    pub async fn execute_operation(&self, op_hash: CausaHash) -> Result<(), RuntimeError> {
        let store = self.store.as_ref();
        let operation = causa_graph::get_operation(store, op_hash)
            .await?
            .ok_or_else(|| RuntimeError::DanglingReference(op_hash.to_string()))?;
        let funsie = causa_graph::get_funsie(store, operation.funsie)
            .await?
            .ok_or_else(|| RuntimeError::DanglingReference(operation.funsie.to_string()))?;

        // Shell and subdag bodies have no way to consume a `Result`-shaped
        // input in user code, so every one of their inputs is strict
        // regardless of the slot's declared flag; only callables honor
        // per-slot `strict: false`.
        let always_strict = !matches!(funsie.kind, FunsieKind::Callable { .. });
        let resolved = self.resolve_inputs(&operation, &funsie, always_strict).await?;
        let inputs = match resolved {
            ResolvedInputs::UpstreamError(record) => {
                tracing::info!(op = %op_hash, "short-circuited on strict upstream error");
                return self.commit_whole_op_error(op_hash, &operation, record).await;
            }
            ResolvedInputs::Ready(inputs) => inputs,
        };

        let store_clone = self.store.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_interval).await;
                let _ = store_clone.heartbeat(op_hash).await;
            }
        });

        let attempt = self.dispatch(op_hash, &operation, &funsie, inputs);
        let outcome = match parse_timeout(&funsie) {
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(DispatchFailure::Domain(ErrorRecord::new(ErrorKind::Timeout, op_hash, "operation exceeded its configured timeout"))),
            },
            None => attempt.await,
        };
        heartbeat.abort();

        match outcome {
            Ok(DispatchOutcome::Outputs(outputs)) => self.commit_outputs(op_hash, &operation, &funsie, outputs).await,
            Ok(DispatchOutcome::SubdagHandled) => self.commit_subdag_done(op_hash).await,
            Err(DispatchFailure::Domain(record)) => self.commit_whole_op_error(op_hash, &operation, record).await,
            Err(DispatchFailure::Infra(e)) => Err(e),
        }
    }

    async fn dispatch(
        &self,
        op_hash: CausaHash,
        operation: &Operation,
        funsie: &Funsie,
        inputs: BTreeMap<String, CallableInput>,
    ) -> Result<DispatchOutcome, DispatchFailure> {
        match &funsie.kind {
            FunsieKind::Shell(commands) => {
                let bytes_only: BTreeMap<String, Vec<u8>> = inputs
                    .into_iter()
                    .map(|(name, value)| (name, value.ok().map(|b| b.to_vec()).unwrap_or_default()))
                    .collect();
                dispatch_shell(&self.config.shell, commands, &self.config.scratch_base, &bytes_only, &funsie.outputs, op_hash).await
            }
            FunsieKind::Callable { name } => {
                dispatch_callable(&self.callables, name, &inputs, &funsie.outputs, op_hash).await
            }
            FunsieKind::Subdag { generator } => {
                dispatch_subdag(self.store.as_ref(), &self.generators, generator, &inputs, op_hash, funsie, operation, op_hash).await
            }
            FunsieKind::DataSource => {
                // Not reachable through `Workflow`'s public API — constants
                // are ingested via `put_const_artifact` directly, never as
                // an operation a worker claims. Defensive stub only.
                let outputs = funsie
                    .outputs
                    .iter()
                    .map(|slot| {
                        (slot.name.clone(), Err(ErrorRecord::new(ErrorKind::MissingOutput, op_hash, "data source operations are never dispatched")))
                    })
                    .collect();
                Ok(DispatchOutcome::Outputs(outputs))
            }
        }
    }

    /// Resolve every input slot's artifact, following `Linked` redirects.
    /// Returns `UpstreamError` as soon as a strict slot is found in error.
    async fn resolve_inputs(
        &self,
        operation: &Operation,
        funsie: &Funsie,
        always_strict: bool,
    ) -> Result<ResolvedInputs, RuntimeError> {
        let store = self.store.as_ref();
        let mut resolved = BTreeMap::new();
        for (slot_name, hash) in &operation.input_bindings {
            let strict = always_strict
                || funsie.inputs.iter().find(|s| &s.name == slot_name).map(|s| s.strict).unwrap_or(true);
            let (_, status) = causa_graph::resolve_linked(store, *hash).await?;
            match status {
                Some(ArtifactStatus::Ready) => match causa_graph::fetch(store, *hash).await? {
                    causa_graph::ArtifactContent::Ready(bytes, _) => {
                        resolved.insert(slot_name.clone(), CallableInput::Ok(bytes));
                    }
                    _ => unreachable!("resolve_linked reported Ready"),
                },
                Some(ArtifactStatus::Error) => {
                    let record = match causa_graph::fetch(store, *hash).await? {
                        causa_graph::ArtifactContent::Error(record) => record,
                        _ => unreachable!("resolve_linked reported Error"),
                    };
                    if strict {
                        return Ok(ResolvedInputs::UpstreamError(ErrorRecord::new(
                            ErrorKind::Upstream,
                            record.origin,
                            format!("strict input {slot_name:?} resolved to an error: {}", record.message),
                        )));
                    }
                    resolved.insert(slot_name.clone(), CallableInput::Err(record));
                }
                Some(ArtifactStatus::Unresolved) | None => {
                    // The executor only enqueues once every input is
                    // terminal; observing otherwise here means a race or a
                    // bug upstream. Bail out without committing so reclaim
                    // picks the operation back up once the race resolves.
                    return Err(RuntimeError::DanglingReference(hash.to_string()));
                }
                Some(ArtifactStatus::Linked(_)) => unreachable!("resolve_linked always follows through Linked"),
            }
        }
        Ok(ResolvedInputs::Ready(resolved))
    }

    async fn commit_outputs(
        &self,
        op_hash: CausaHash,
        operation: &Operation,
        funsie: &Funsie,
        outputs: BTreeMap<String, Result<Vec<u8>, ErrorRecord>>,
    ) -> Result<(), RuntimeError> {
        let store = self.store.as_ref();
        let mut any_error = false;
        for (slot_name, result) in outputs {
            let declared_hash = *operation
                .output_bindings
                .get(&slot_name)
                .ok_or_else(|| RuntimeError::DanglingReference(slot_name.clone()))?;
            match result {
                Ok(bytes) => {
                    let encoding = funsie
                        .outputs
                        .iter()
                        .find(|s| s.name == slot_name)
                        .map(|s| s.encoding)
                        .unwrap_or(causa_types::Encoding::RawBytes);
                    self.write_back_output(declared_hash, encoding, bytes).await?;
                }
                Err(record) => {
                    any_error = true;
                    self.write_back_error(declared_hash, record).await?;
                }
            }
        }
        let status = if any_error { OperationStatus::Error } else { OperationStatus::Done };
        store.put(&causa_graph::op_status_key(op_hash), serde_json::to_vec(&status).map_err(|e| RuntimeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?).await?;
        self.store.publish(op_hash);
        tracing::info!(op = %op_hash, ?status, "operation committed");
        Ok(())
    }

    /// Write a produced output's bytes under its content-derived identity
    /// (deduplicating against any other producer of the same bytes) and
    /// redirect the operation's declared output artifact to it.
    async fn write_back_output(&self, declared_hash: CausaHash, encoding: causa_types::Encoding, bytes: Vec<u8>) -> Result<(), RuntimeError> {
        let store = self.store.as_ref();
        let content_hash = causa_graph::put_const_artifact(store, encoding, bytes).await?;
        match causa_graph::transition_artifact(store, declared_hash, ArtifactStatus::Linked(content_hash)).await {
            Ok(()) | Err(GraphError::AlreadyTerminal { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_back_error(&self, declared_hash: CausaHash, record: ErrorRecord) -> Result<(), RuntimeError> {
        let store = self.store.as_ref();
        let err_key = causa_graph::art_err_key(declared_hash);
        let bytes = serde_json::to_vec(&record).map_err(|e| RuntimeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        store.put(&err_key, bytes).await?;
        match causa_graph::transition_artifact(store, declared_hash, ArtifactStatus::Error).await {
            Ok(()) | Err(GraphError::AlreadyTerminal { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_whole_op_error(&self, op_hash: CausaHash, operation: &Operation, record: ErrorRecord) -> Result<(), RuntimeError> {
        for declared_hash in operation.output_bindings.values().copied() {
            self.write_back_error(declared_hash, record.clone()).await?;
        }
        let bytes = serde_json::to_vec(&OperationStatus::Error).map_err(|e| RuntimeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.store.put(&causa_graph::op_status_key(op_hash), bytes).await?;
        self.store.publish(op_hash);
        tracing::info!(op = %op_hash, kind = ?record.kind, "operation committed as error");
        Ok(())
    }

    /// A subdag operation's own outputs are already `Linked` by
    /// `materialize_subdag`; all that remains is marking the operation done.
    async fn commit_subdag_done(&self, op_hash: CausaHash) -> Result<(), RuntimeError> {
        let bytes = serde_json::to_vec(&OperationStatus::Done).map_err(|e| RuntimeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.store.put(&causa_graph::op_status_key(op_hash), bytes).await?;
        self.store.publish(op_hash);
        Ok(())
    }
}

/// Decode an optional wall-clock timeout from a funsie's opaque `extra`
/// bytes (a JSON-encoded millisecond count), if present.
fn parse_timeout(funsie: &Funsie) -> Option<Duration> {
    let extra = funsie.extra.as_ref()?;
    let millis: u64 = serde_json::from_slice(extra).ok()?;
    Some(Duration::from_millis(millis))
}
