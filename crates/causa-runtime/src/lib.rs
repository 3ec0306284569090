#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **causa-runtime** – Worker runtime for the causa workflow engine.
//!
//! Owns the claim/execute/commit loop a worker process drives against the
//! shared store: resolving an operation's inputs, dispatching by funsie
//! kind (sandboxed shell, registered callable, registered sub-DAG
//! generator), and writing results back with content-hash dedup. This crate
//! knows nothing about DAG traversal or scheduling — see `causa-executor`
//! for that; a worker only ever looks at the one operation it just claimed.

mod config;
mod dispatch;
mod error;
mod registry;
mod worker;

pub use config::{BackendKind, RuntimeConfig, WorkerConfig};
pub use dispatch::{dispatch_callable, dispatch_shell, dispatch_subdag, DispatchFailure, DispatchOutcome};
pub use error::RuntimeError;
pub use registry::{CallableFn, CallableInput, CallableRegistry, GeneratorFn, GeneratorRegistry};
pub use worker::Worker;
