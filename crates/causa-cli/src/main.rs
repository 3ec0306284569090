#![forbid(unsafe_code)]

//! **causa-cli** – Command-line interface for the causa workflow engine.
//!
//! Thin wiring over `causa-store-{memory,sled}`, `causa-graph`,
//! `causa-executor`, and `causa-runtime`: pick a backend, build the shared
//! store, and hand it to whichever subcommand the user asked for.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use causa_executor::{Executor, ExecutorConfig};
use causa_runtime::{CallableRegistry, GeneratorRegistry, Worker, WorkerConfig};
use causa_store_core::Store;
use causa_store_memory::MemoryStore;
use causa_store_sled::SledStore;
use causa_types::CausaHash;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "causa")]
#[command(about = "A decentralized, content-addressed workflow engine")]
#[command(version)]
struct Cli {
    /// Store backend to use (memory, sled)
    #[arg(long, default_value = "memory", global = true)]
    backend: String,

    /// Database path, used only when `--backend sled`
    #[arg(long, default_value = "causa.db", global = true)]
    db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error); overridden by `RUST_LOG`
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for per-operation shell scratch directories
    #[arg(long, global = true)]
    scratch_base: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one worker: claim operations and execute them until shutdown.
    Worker {
        /// Reserved for a future multi-queue store; accepted for
        /// command-line compatibility with the single default queue today.
        #[arg(long)]
        queue: Option<String>,
    },
    /// Enqueue the given artifact hashes (or unambiguous prefixes) and
    /// block until all of them are terminal.
    Execute {
        /// Target artifact hashes or unambiguous hex prefixes (>= 4 chars).
        #[arg(required = true)]
        hashes: Vec<String>,
    },
    /// Print a ready artifact's bytes to stdout.
    Cat {
        /// Artifact hash or unambiguous hex prefix.
        hash: String,
    },
    /// Signal running workers to drain: stop claiming new operations.
    Shutdown {
        /// Accepted for CLI symmetry; this store has a
        /// single shared queue, so every worker sharing it is signalled
        /// either way.
        #[arg(long)]
        all: bool,
    },
    /// Emit the full provenance graph (operations, artifacts, bindings) as
    /// Graphviz DOT.
    Graph,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let store = build_store(&cli.backend, &cli.db_path).await?;

    match cli.command {
        Commands::Worker { queue } => run_worker(store, cli.scratch_base, queue).await,
        Commands::Execute { hashes } => run_execute(store, hashes).await,
        Commands::Cat { hash } => run_cat(store, hash).await,
        Commands::Shutdown { all } => run_shutdown(store, all).await,
        Commands::Graph => run_graph(store).await,
    }
}

async fn build_store(backend: &str, db_path: &PathBuf) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match backend.to_lowercase().as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        "sled" => Arc::new(SledStore::open(db_path)?),
        other => return Err(anyhow!("unknown backend {other:?}, expected \"memory\" or \"sled\"")),
    };
    causa_graph::ensure_version_tag(store.as_ref()).await?;
    Ok(store)
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn run_worker(store: Arc<dyn Store>, scratch_base: Option<PathBuf>, queue: Option<String>) -> Result<ExitCode> {
    if let Some(queue) = &queue {
        info!(queue, "queue selection is not yet partitioned by name; running against the shared queue");
    }
    let mut worker_config = WorkerConfig::default();
    if let Some(scratch_base) = scratch_base {
        worker_config.scratch_base = scratch_base;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, signalling worker to drain");
        let _ = shutdown_tx.send(true);
    });

    let worker = Worker::new(store, worker_config, Arc::new(CallableRegistry::new()), Arc::new(GeneratorRegistry::new()));
    match worker.run(shutdown_rx).await {
        Ok(()) => {
            info!("worker stopped cleanly");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::error!(error = %e, "worker stopped on a fatal store failure");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_execute(store: Arc<dyn Store>, hashes: Vec<String>) -> Result<ExitCode> {
    let mut targets = Vec::with_capacity(hashes.len());
    for raw in &hashes {
        targets.push(resolve_hash(store.as_ref(), raw).await?);
    }
    let executor = Executor::new(store, ExecutorConfig::default());
    let report = executor.execute(&targets).await?;
    for (hash, outcome) in &report.outcomes {
        println!("{hash} {outcome:?}");
    }
    Ok(if report.all_ready() { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

async fn run_cat(store: Arc<dyn Store>, raw: String) -> Result<ExitCode> {
    let hash = match resolve_hash(store.as_ref(), &raw).await {
        Ok(hash) => hash,
        Err(_) => return Ok(ExitCode::from(2)),
    };
    match causa_graph::fetch(store.as_ref(), hash).await? {
        causa_graph::ArtifactContent::Ready(bytes, _) => {
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
            Ok(ExitCode::SUCCESS)
        }
        causa_graph::ArtifactContent::Error(record) => {
            eprintln!("error: {:?} (origin {}): {}", record.kind, record.origin, record.message);
            Ok(ExitCode::from(1))
        }
        causa_graph::ArtifactContent::Unresolved => {
            eprintln!("not found: artifact {hash} is not yet resolved");
            Ok(ExitCode::from(2))
        }
    }
}

async fn run_shutdown(store: Arc<dyn Store>, all: bool) -> Result<ExitCode> {
    store.shutdown().await?;
    info!(all, "signalled shared queue to drain");
    Ok(ExitCode::SUCCESS)
}

async fn run_graph(store: Arc<dyn Store>) -> Result<ExitCode> {
    let dot = render_dot(store.as_ref()).await?;
    println!("{dot}");
    Ok(ExitCode::SUCCESS)
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

async fn resolve_hash(store: &dyn causa_store_core::KvStore, raw: &str) -> Result<CausaHash> {
    if let Ok(hash) = raw.parse::<CausaHash>() {
        return Ok(hash);
    }
    causa_graph::resolve_prefix(store, raw).await.map_err(|e| anyhow!(e))
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

/// Manual Graphviz DOT writer over the stored operations and artifacts: no
/// graph-rendering crate in the dependency tree, and the format is simple
/// enough not to need one.
async fn render_dot(store: &dyn causa_store_core::KvStore) -> Result<String> {
    let mut out = String::from("digraph causa {\n  rankdir=LR;\n");

    for key in store.scan_prefix(causa_graph::OP_PREFIX).await? {
        let Some(hex) = key.strip_prefix(causa_graph::OP_PREFIX) else { continue };
        if hex.contains(':') {
            continue;
        }
        let Ok(op_hash) = hex.parse::<CausaHash>() else { continue };
        let Some(operation) = causa_graph::get_operation(store, op_hash).await? else { continue };
        let status = causa_graph::operation_status(store, op_hash).await?;
        out.push_str(&format!("  \"{op_hash}\" [shape=box,label=\"op {:.8}\\n{:?}\"];\n", op_hash.to_hex(), status));
        for (slot, input_hash) in &operation.input_bindings {
            out.push_str(&format!("  \"{input_hash}\" -> \"{op_hash}\" [label=\"{slot}\"];\n"));
        }
        for (slot, output_hash) in &operation.output_bindings {
            out.push_str(&format!("  \"{op_hash}\" -> \"{output_hash}\" [label=\"{slot}\"];\n"));
        }
    }
    for key in store.scan_prefix(causa_graph::ART_PREFIX).await? {
        let Some(hex) = key.strip_prefix(causa_graph::ART_PREFIX) else { continue };
        if hex.contains(':') {
            continue;
        }
        let Ok(art_hash) = hex.parse::<CausaHash>() else { continue };
        let status = causa_graph::artifact_status(store, art_hash).await?;
        out.push_str(&format!("  \"{art_hash}\" [label=\"art {:.8}\\n{:?}\"];\n", art_hash.to_hex(), status));
    }

    out.push_str("}\n");
    Ok(out)
}
