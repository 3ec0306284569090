//! Per-kind execution: given a funsie's resolved inputs, actually produce
//! its outputs. One function per [`FunsieKind`] variant; `worker.rs` decides
//! which to call and handles the commit.
//!
//! Shell execution runs against a scratch directory with a configurable
//! shell executable, using `tokio::process::Command` rather than
//! `std::process::Command` so a slow command doesn't block the worker's
//! async runtime.

use std::collections::BTreeMap;
use std::path::Path;

use causa_graph::{GraphError, SubdagSpec};
use causa_store_core::KvStore;
use causa_types::{CausaHash, ErrorKind, ErrorRecord, Funsie, Operation, Slot};

use crate::error::RuntimeError;
use crate::registry::{CallableInput, CallableRegistry, GeneratorRegistry};

/// What a dispatch call produced, before the worker writes it back.
pub enum DispatchOutcome {
    /// Per-output-slot bytes, or a per-output failure (a missing
    /// declared output fails only that output, a nonzero exit fails the
    /// whole operation").
    Outputs(BTreeMap<String, Result<Vec<u8>, ErrorRecord>>),
    /// A sub-DAG generator ran and `causa_graph::materialize_subdag` already
    /// rebound the operation's declared outputs to `Linked` redirects —
    /// there is nothing left for the worker to write back.
    SubdagHandled,
}

/// Why a dispatch attempt did not produce a [`DispatchOutcome`].
pub enum DispatchFailure {
    /// A well-defined domain failure: the whole operation is `Error`.
    Domain(ErrorRecord),
    /// The worker itself could not complete the attempt; the operation
    /// stays `Running` for reclaim.
    Infra(RuntimeError),
}

impl From<RuntimeError> for DispatchFailure {
    fn from(e: RuntimeError) -> Self {
        DispatchFailure::Infra(e)
    }
}

impl From<GraphError> for DispatchFailure {
    fn from(e: GraphError) -> Self {
        DispatchFailure::Infra(RuntimeError::Graph(e))
    }
}

/// Run a shell funsie's command sequence inside a fresh scratch directory.
///
/// Each input slot's bytes are written to a same-named file before the first
/// command runs. Commands execute in order via `{shell} -c {command}`; any
/// nonzero exit aborts the whole operation (`ErrorKind::NonzeroExit`). Once
/// every command has exited zero, each declared output slot is resolved
/// either from that command index's captured stdout/stderr (slots named
/// `stdoutN`/`stderrN`) or by reading a same-named file out of the scratch
/// directory — missing files fail only that output.
pub async fn dispatch_shell(
    shell: &str,
    commands: &[String],
    scratch_base: &Path,
    inputs: &BTreeMap<String, Vec<u8>>,
    output_slots: &[Slot],
    origin: CausaHash,
) -> Result<DispatchOutcome, DispatchFailure> {
    tokio::fs::create_dir_all(scratch_base).await.map_err(RuntimeError::Io)?;
    let dir = tempfile::Builder::new()
        .prefix("causa-op-")
        .tempdir_in(scratch_base)
        .map_err(RuntimeError::Io)?;

    for (slot, bytes) in inputs {
        tokio::fs::write(dir.path().join(slot), bytes).await.map_err(RuntimeError::Io)?;
    }

    let mut captures: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(commands.len());
    for (idx, command) in commands.iter().enumerate() {
        let output = tokio::process::Command::new(shell)
            .arg("-c")
            .arg(command)
            .current_dir(dir.path())
            .output()
            .await
            .map_err(RuntimeError::Io)?;
        if !output.status.success() {
            return Err(DispatchFailure::Domain(ErrorRecord::new(
                ErrorKind::NonzeroExit,
                origin,
                format!("command {idx} ({command:?}) exited with {}", output.status),
            )));
        }
        captures.push((output.stdout, output.stderr));
    }

    let mut outputs = BTreeMap::new();
    for slot in output_slots {
        let resolved = if let Some(idx) = slot.name.strip_prefix("stdout").and_then(|n| n.parse::<usize>().ok()) {
            captures.get(idx).map(|(stdout, _)| stdout.clone())
        } else if let Some(idx) = slot.name.strip_prefix("stderr").and_then(|n| n.parse::<usize>().ok()) {
            captures.get(idx).map(|(_, stderr)| stderr.clone())
        } else {
            tokio::fs::read(dir.path().join(&slot.name)).await.ok()
        };
        let value = resolved.ok_or_else(|| {
            ErrorRecord::new(ErrorKind::MissingOutput, origin, format!("output slot {:?} was never produced", slot.name))
        });
        outputs.insert(slot.name.clone(), value);
    }
    Ok(DispatchOutcome::Outputs(outputs))
}

/// Invoke a registered callable with its resolved inputs.
pub async fn dispatch_callable(
    registry: &CallableRegistry,
    name: &str,
    inputs: &BTreeMap<String, CallableInput>,
    output_slots: &[Slot],
    origin: CausaHash,
) -> Result<DispatchOutcome, DispatchFailure> {
    let f = registry
        .resolve(name)
        .ok_or_else(|| RuntimeError::UnregisteredHandler { kind: "callable", name: name.to_string() })?;
    match f(inputs) {
        Ok(produced) => {
            let mut outputs = BTreeMap::new();
            for slot in output_slots {
                let value = produced.get(&slot.name).cloned().ok_or_else(|| {
                    ErrorRecord::new(ErrorKind::MissingOutput, origin, format!("callable did not produce {:?}", slot.name))
                });
                outputs.insert(slot.name.clone(), value);
            }
            Ok(DispatchOutcome::Outputs(outputs))
        }
        Err(message) => Err(DispatchFailure::Domain(ErrorRecord::new(ErrorKind::CallableRaised, origin, message))),
    }
}

/// Invoke a registered sub-DAG generator and splice its result into the
/// graph via `causa_graph::materialize_subdag`.
pub async fn dispatch_subdag(
    store: &dyn KvStore,
    registry: &GeneratorRegistry,
    generator: &str,
    inputs: &BTreeMap<String, CallableInput>,
    op_hash: CausaHash,
    funsie: &Funsie,
    operation: &Operation,
    origin: CausaHash,
) -> Result<DispatchOutcome, DispatchFailure> {
    let f = registry
        .resolve(generator)
        .ok_or_else(|| RuntimeError::UnregisteredHandler { kind: "generator", name: generator.to_string() })?;
    let spec: SubdagSpec = match f(inputs) {
        Ok(spec) => spec,
        Err(message) => return Err(DispatchFailure::Domain(ErrorRecord::new(ErrorKind::CallableRaised, origin, message))),
    };
    match causa_graph::materialize_subdag(store, op_hash, funsie, operation, spec).await {
        Ok(()) => Ok(DispatchOutcome::SubdagHandled),
        Err(GraphError::SubdagArity { expected, found }) => Err(DispatchFailure::Domain(ErrorRecord::new(
            ErrorKind::SubdagArity,
            origin,
            format!("generator declared {found} outputs, funsie expects {expected}"),
        ))),
        Err(e) => Err(e.into()),
    }
}
