//! Object storage daemon (osd).
//!
//! Usage:
//!   osd [OPTIONS] <DIR>
//!
//! Initializes the configured storage layout at `DIR`, removes temporary
//! files left behind by a crash and runs the open file lease sweep until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};

use osd::cleanup::remove_stale_tmp_files;
use osd::engine::run_sweep_loop;
use osd::storage::available_layouts;
use osd::{EngineConfig, StorageEngine};
use osd_proto::defaults::*;

/// Object storage daemon
#[derive(Parser, Debug)]
#[command(name = "osd", version, about = "Per-node object storage daemon")]
struct Args {
    /// Storage directory
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Storage layout: "hash" (file per object) or "single" (file per file id)
    #[arg(short = 'L', long, default_value = DEFAULT_LAYOUT)]
    layout: String,

    /// Store and verify a CRC-32C per object version
    #[arg(short = 'c', long)]
    checksums: bool,

    /// Do not fsync object data before acknowledging writes
    #[arg(long)]
    no_sync: bool,

    /// Number of file metadata entries kept in memory
    #[arg(long, default_value_t = DEFAULT_METADATA_CACHE_SIZE)]
    cache_size: usize,

    /// Subdirectories per hash directory level
    #[arg(long, default_value_t = DEFAULT_SUBDIRS)]
    subdirs: u32,

    /// Depth of the hashed directory tree
    #[arg(long, default_value_t = DEFAULT_MAX_DIR_DEPTH)]
    max_depth: u32,

    /// Default open file lease in seconds
    #[arg(long, default_value_t = DEFAULT_LEASE_SECS)]
    lease: u64,

    /// Interval between lease sweeps in seconds
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval: u64,

    /// Position of this node within the stripe
    #[arg(short = 'n', long, default_value_t = DEFAULT_NODE_INDEX)]
    node_index: u32,

    /// Create the storage directory if it does not exist
    #[arg(long)]
    init: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::new(&self.dir)
            .with_layout(&self.layout)
            .with_checksums(self.checksums);
        cfg.sync_writes = !self.no_sync;
        cfg.metadata_cache_size = self.cache_size;
        cfg.subdirs = self.subdirs;
        cfg.max_dir_depth = self.max_depth;
        cfg.default_lease = Duration::from_secs(self.lease);
        cfg.sweep_interval = Duration::from_secs(self.sweep_interval);
        cfg.node_index = self.node_index;
        cfg
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("osd v{} starting", env!("CARGO_PKG_VERSION"));

    if !available_layouts().contains(&args.layout.as_str()) {
        error!(
            "unknown layout '{}', expected one of: {}",
            args.layout,
            available_layouts().join(", ")
        );
        std::process::exit(1);
    }

    let cfg = args.engine_config();
    let sweep_interval = cfg.sweep_interval;
    let engine = match StorageEngine::open(cfg, args.init).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("failed to open storage at {}: {}", args.dir.display(), e);
            std::process::exit(1);
        }
    };

    // Nothing is writing yet, so every temporary file is debris.
    if let Err(e) = remove_stale_tmp_files(&args.dir).await {
        error!("failed to clean {}: {}", args.dir.display(), e);
        std::process::exit(1);
    }

    let shutdown = Arc::new(Notify::new());
    let sweeper = tokio::spawn(run_sweep_loop(
        engine.clone(),
        sweep_interval,
        shutdown.clone(),
    ));

    info!(
        "osd ready: {} layout, node index {}, lease {}s",
        engine.layout().name(),
        args.node_index,
        args.lease
    );

    tokio::select! {
        _ = shutdown.notified() => {
            info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    info!("osd shutting down");
    // Leaves a permit if the sweep loop is mid-sweep.
    shutdown.notify_one();
    let _ = sweeper.await;

    // Files still open are closed so that written versions are cut.
    let closed = engine.sweep(u64::MAX).await;
    if !closed.is_empty() {
        info!("closed {} open files", closed.len());
    }
}
