//! Process-local registries resolving a funsie's stable callable/generator
//! name to the boxed Rust closure that actually runs it. Kept as an instance
//! field rather than a process-wide static so tests can run isolated
//! registries concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use causa_graph::SubdagSpec;
use causa_types::ErrorRecord;

/// One resolved input value handed to a callable or generator: either the
/// artifact's bytes, or — for a non-strict slot whose upstream producer
/// errored — the propagated [`ErrorRecord`] as a `Result`-shaped value
/// (errors are values, not exceptions).
#[derive(Debug, Clone)]
pub enum CallableInput {
    /// The input artifact resolved successfully to these bytes.
    Ok(Vec<u8>),
    /// The input artifact (or an ancestor of it) ended in error.
    Err(ErrorRecord),
}

impl CallableInput {
    /// Borrow the bytes, if this input resolved successfully.
    pub fn ok(&self) -> Option<&[u8]> {
        match self {
            CallableInput::Ok(bytes) => Some(bytes),
            CallableInput::Err(_) => None,
        }
    }

    /// Decode a `StructuredValue`-encoded input as JSON.
    pub fn as_json(&self) -> Result<serde_json::Value, String> {
        match self {
            CallableInput::Ok(bytes) => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            CallableInput::Err(err) => Err(format!("input is an error value: {}", err.message)),
        }
    }
}

/// A registered callable: decoded inputs in, named output bytes out, or a
/// plain-string failure message (surfaced to the caller as
/// `ErrorKind::CallableRaised`).
pub type CallableFn = dyn Fn(&BTreeMap<String, CallableInput>) -> Result<BTreeMap<String, Vec<u8>>, String> + Send + Sync;

/// A registered sub-DAG generator: decoded inputs in, a [`SubdagSpec`]
/// describing the generated sub-graph out.
pub type GeneratorFn = dyn Fn(&BTreeMap<String, CallableInput>) -> Result<SubdagSpec, String> + Send + Sync;

/// Registry of named callables, populated at worker startup before the
/// job-queue loop begins.
#[derive(Clone, Default)]
pub struct CallableRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<CallableFn>>>>,
}

impl CallableRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under a stable name. Re-registering the same
    /// name replaces the previous handler (useful for tests).
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&BTreeMap<String, CallableInput>) -> Result<BTreeMap<String, Vec<u8>>, String> + Send + Sync + 'static,
    {
        self.inner.write().expect("callable registry lock poisoned").insert(name.into(), Arc::new(f));
    }

    /// Resolve a callable by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<CallableFn>> {
        self.inner.read().expect("callable registry lock poisoned").get(name).cloned()
    }
}

/// Registry of named sub-DAG generators.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<GeneratorFn>>>>,
}

impl GeneratorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator under a stable name.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&BTreeMap<String, CallableInput>) -> Result<SubdagSpec, String> + Send + Sync + 'static,
    {
        self.inner.write().expect("generator registry lock poisoned").insert(name.into(), Arc::new(f));
    }

    /// Resolve a generator by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<GeneratorFn>> {
        self.inner.read().expect("generator registry lock poisoned").get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_resolves_callable() {
        let registry = CallableRegistry::new();
        registry.register("sum", |inputs: &BTreeMap<String, CallableInput>| {
            let values: Vec<i64> = inputs.get("xs").unwrap().as_json().unwrap().as_array().unwrap().iter().map(|v| v.as_i64().unwrap()).collect();
            let total: i64 = values.iter().sum();
            let mut out = BTreeMap::new();
            out.insert("result".to_string(), serde_json::to_vec(&total).unwrap());
            Ok(out)
        });

        let f = registry.resolve("sum").unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert("xs".to_string(), CallableInput::Ok(serde_json::to_vec(&[1, 2, 3]).unwrap()));
        let out = f(&inputs).unwrap();
        let total: i64 = serde_json::from_slice(&out["result"]).unwrap();
        assert_eq!(total, 6);
    }

    #[test]
    fn unregistered_name_resolves_to_none() {
        let registry = CallableRegistry::new();
        assert!(registry.resolve("missing").is_none());
    }
}
