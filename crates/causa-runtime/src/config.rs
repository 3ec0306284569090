//! Runtime configuration, shared by `causa-cli` and `causa-runtime`. Loaded
//! from CLI flags with `CAUSA_*` environment fallback — never from a
//! committed secret file, since this engine has no auth layer to speak of.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which `KvStore`/`JobQueue`/`NotifyBus` backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Non-persistent, single-process backend (`causa-store-memory`).
    Memory,
    /// Durable, disk-backed backend (`causa-store-sled`).
    Sled,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Memory
    }
}

/// Shared configuration for the store backend, the job queue, and reclaim
/// policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Store backend selection.
    pub backend: BackendKind,
    /// Database path, used only when `backend == Sled`.
    pub sled_path: PathBuf,
    /// Base directory under which per-operation scratch directories are
    /// created for shell execution.
    pub scratch_base: PathBuf,
    /// How long a claimed operation may go without a heartbeat before the
    /// executor reclaims and re-enqueues it (default: 15 minutes).
    pub reclaim_staleness_secs: u64,
    /// Notification-bus broadcast channel buffer size.
    pub broadcast_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            sled_path: PathBuf::from("causa.db"),
            scratch_base: std::env::temp_dir().join("causa-scratch"),
            reclaim_staleness_secs: 15 * 60,
            broadcast_buffer: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Apply `CAUSA_*` environment variable overrides on top of `self`.
    /// CLI flags take precedence; these fill in whatever the flags left
    /// at their defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(backend) = std::env::var("CAUSA_BACKEND") {
            self.backend = match backend.to_lowercase().as_str() {
                "sled" => BackendKind::Sled,
                _ => BackendKind::Memory,
            };
        }
        if let Ok(path) = std::env::var("CAUSA_SLED_PATH") {
            self.sled_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CAUSA_SCRATCH_BASE") {
            self.scratch_base = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("CAUSA_RECLAIM_STALENESS_SECS") {
            if let Ok(parsed) = secs.parse() {
                self.reclaim_staleness_secs = parsed;
            }
        }
        self
    }

    /// The reclaim staleness threshold as a [`Duration`].
    pub fn reclaim_staleness(&self) -> Duration {
        Duration::from_secs(self.reclaim_staleness_secs)
    }
}

/// Worker-local settings that don't need to be shared with the executor
/// side of the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base directory for per-operation scratch directories.
    pub scratch_base: PathBuf,
    /// Shell executable used to run `shell` funsie command sequences.
    pub shell: String,
    /// How often a worker refreshes a claimed operation's lease while it
    /// runs, so a legitimately slow operation is not mistaken for a dead
    /// worker by the executor's stale-claim reclaim. Kept at a third of the
    /// reclaim staleness so at least two heartbeats land before a timeout.
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_base: std::env::temp_dir().join("causa-scratch"),
            shell: "/bin/sh".to_string(),
            heartbeat_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&RuntimeConfig> for WorkerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            scratch_base: config.scratch_base.clone(),
            shell: WorkerConfig::default().shell,
            heartbeat_interval: config.reclaim_staleness() / 3,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_is_memory() {
        assert_eq!(RuntimeConfig::default().backend, BackendKind::Memory);
    }

    #[test]
    fn reclaim_staleness_defaults_to_fifteen_minutes() {
        assert_eq!(RuntimeConfig::default().reclaim_staleness(), Duration::from_secs(900));
    }
}
