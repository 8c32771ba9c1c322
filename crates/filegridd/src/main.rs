//! filegridd: the filegrid daemon.
//!
//! Crawls a project root, boots the worker pool, assigns every file to a
//! worker and has it analyzed there, then prints the pool's load as JSON.
//!
//! # Usage
//!
//! ```text
//! filegridd run --root ./my-project --config filegrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

use filegrid_core::{CrawledFileStats, FilegridConfig, StaticProjectConfig};
use filegrid_scheduler::{FileAllocator, SchedulerError, WorkerManager};
use filegrid_worker::ThreadSpawner;

/// Config file picked up from the project root when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "filegrid.toml";

#[derive(Parser)]
#[command(name = "filegridd", about = "filegrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assign and analyze every file under a project root.
    Run {
        /// Project root to crawl.
        #[arg(long)]
        root: PathBuf,

        /// Config file. Defaults to `<root>/filegrid.toml` if present.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Keep every file on the in-process worker.
        #[arg(long)]
        inband: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,filegrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            root,
            config,
            inband,
        } => run(root, config, inband).await,
    }
}

fn load_config(root: &Path, config: Option<PathBuf>) -> anyhow::Result<FilegridConfig> {
    let path = match config {
        Some(path) => path,
        None => {
            let candidate = root.join(DEFAULT_CONFIG_FILE);
            if !candidate.is_file() {
                info!("no config file, using defaults");
                return Ok(FilegridConfig::default());
            }
            candidate
        }
    };
    let config = FilegridConfig::from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

async fn run(root: PathBuf, config: Option<PathBuf>, inband: bool) -> anyhow::Result<()> {
    let root = std::fs::canonicalize(&root)
        .with_context(|| format!("resolving project root {}", root.display()))?;
    let config = load_config(&root, config)?;

    let mut settings = config.scheduler_settings();
    settings.inband_only |= inband;
    info!(
        root = %root.display(),
        max_workers = settings.max_worker_count,
        inband = settings.inband_only,
        "filegrid daemon starting"
    );

    // ── Crawl ──────────────────────────────────────────────────

    let stats = Arc::new(CrawledFileStats::new());
    let crawled = {
        let stats = stats.clone();
        let root = root.clone();
        tokio::task::spawn_blocking(move || stats.crawl(&root)).await??
    };

    // ── Worker pool ────────────────────────────────────────────

    let manager = WorkerManager::new(
        settings,
        stats.clone(),
        Arc::new(StaticProjectConfig::from_config(&config)),
        Arc::new(ThreadSpawner::default()),
    )
    .with_health(config.health_settings());
    manager.init().await?;
    let allocator = Arc::new(FileAllocator::new(Arc::new(manager)));

    // ── Assign + analyze ───────────────────────────────────────

    let mut tasks = JoinSet::new();
    for (path, _) in stats.files() {
        let allocator = allocator.clone();
        tasks.spawn(async move {
            let result = allocator.analyze(Path::new(&path)).await;
            (path, result)
        });
    }

    let (mut analyzed, mut skipped, mut bytes, mut lines) = (0u64, 0u64, 0u64, 0u64);
    while let Some(joined) = tasks.join_next().await {
        let (path, result) = joined?;
        match result {
            Ok(analysis) => {
                analyzed += 1;
                bytes += analysis.bytes;
                lines += analysis.lines;
            }
            Err(err @ SchedulerError::SizeLimitExceeded { .. }) => {
                skipped += 1;
                warn!(%path, error = %err, "skipped");
            }
            Err(err) => {
                allocator.manager().end().await;
                return Err(err).with_context(|| format!("analyzing {path}"));
            }
        }
    }

    let report = json!({
        "root": root.display().to_string(),
        "files": crawled,
        "analyzed": analyzed,
        "skipped": skipped,
        "bytes": bytes,
        "lines": lines,
        "workers": allocator.manager().summary(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    allocator.manager().end().await;
    info!("filegrid daemon finished");
    Ok(())
}
