use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use pipeline::{
    bundle, planner,
    ffprobe::StreamProber,
    FfmpegRunner, FileMetadataStore, JobOutcome, JobRequest, MetadataStore, PipelineConfig,
    PlanPolicy, ProcessRunner, ProgressSink, EncodeQueue,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// HLS packaging daemon: probe, encode, and publish media as HLS bundles
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode one or more files into HLS bundles, one at a time
    Encode {
        /// Source media files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Display name (only valid with a single file)
        #[arg(short, long)]
        name: Option<String>,

        /// Encode even if the asset was already published
        #[arg(long)]
        force: bool,

        /// Print each job outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the stream inventory and encode plan for a file as JSON
    Probe {
        file: PathBuf,
    },
    /// Remove bundles that never got a master playlist
    Sweep,
}

/// Prints status messages to stdout, prefixed with the job's display name
struct StdoutSink {
    label: String,
}

impl ProgressSink for StdoutSink {
    fn report(&self, text: &str) {
        for line in text.lines() {
            println!("[{}] {}", self.label, line);
        }
    }
}

#[derive(Serialize)]
struct ProbeReport<'a> {
    file: &'a Path,
    inventory: &'a pipeline::StreamInventory,
    plan: &'a pipeline::EncodePlan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Commands::Encode { files, name, force, json } => encode(cfg, files, name, force, json).await,
        Commands::Probe { file } => probe(cfg, &file).await,
        Commands::Sweep => {
            let removed = bundle::sweep_incomplete_bundles(&cfg.output_root)
                .with_context(|| format!("Failed to sweep {}", cfg.output_root.display()))?;
            info!("✅ Removed {} incomplete bundle(s)", removed);
            Ok(())
        }
    }
}

async fn probe(cfg: PipelineConfig, file: &Path) -> Result<()> {
    let runner: Arc<dyn ProcessRunner> = Arc::new(FfmpegRunner::new(&cfg));
    let prober = StreamProber::new(runner, cfg.clone());
    let inventory = prober
        .probe(file, &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to probe {}", file.display()))?;
    let plan = planner::plan(&inventory, &PlanPolicy::from_config(&cfg));

    let report = ProbeReport {
        file,
        inventory: &inventory,
        plan: &plan,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Dedup key the intake uses: file name plus size
fn asset_key(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("Source path has no file name")?;
    Ok(format!("{}-{}", name, meta.len()))
}

async fn encode(cfg: PipelineConfig, files: Vec<PathBuf>, name: Option<String>, force: bool, json: bool) -> Result<()> {
    if name.is_some() && files.len() > 1 {
        anyhow::bail!("--name can only be used with a single file");
    }

    info!("HLS daemon starting");
    info!("Configuration loaded:");
    info!("  Output root: {}", cfg.output_root.display());
    info!("  Record dir: {}", cfg.record_dir.display());
    info!("  Retention: {:?}", cfg.retention);
    info!("  Copy video codecs: {:?}", cfg.copy_video_codecs);
    info!("  Segment length: {}s", cfg.hls_segment_secs);

    fs::create_dir_all(&cfg.output_root)
        .with_context(|| format!("Failed to create output root: {}", cfg.output_root.display()))?;
    fs::create_dir_all(&cfg.record_dir)
        .with_context(|| format!("Failed to create record directory: {}", cfg.record_dir.display()))?;

    // Bundles still claimed by a live hlsd belong to another run and are kept
    info!("🔄 Checking for incomplete bundles...");
    let swept = bundle::sweep_incomplete_bundles(&cfg.output_root)
        .context("Failed to sweep incomplete bundles")?;
    if swept > 0 {
        info!("✅ Removed {} incomplete bundle(s)", swept);
    }

    let store = Arc::new(FileMetadataStore::new(&cfg.record_dir));
    let runner: Arc<dyn ProcessRunner> = Arc::new(FfmpegRunner::new(&cfg));
    let queue = EncodeQueue::start(cfg.clone(), runner, store.clone());
    let mut outcomes = queue.subscribe();

    let mut waiting = HashSet::new();
    let mut skipped = 0;
    for path in files {
        let path = fs::canonicalize(&path).unwrap_or(path);
        let key = match asset_key(&path) {
            Ok(key) => key,
            Err(e) => {
                warn!("Skipping {}: {:#}", path.display(), e);
                skipped += 1;
                continue;
            }
        };
        if !force && store.exists(&key).context("Failed to query metadata store")? {
            warn!("Skipping {}: already published (use --force to encode again)", path.display());
            continue;
        }

        let label = name.clone().unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string())
        });
        let sink = Arc::new(StdoutSink { label: label.clone() });
        let ticket = queue.enqueue(JobRequest::new(&path, label, sink).with_asset_key(key))?;
        waiting.insert(ticket.job_id);
    }

    let mut failed = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !waiting.is_empty() {
        tokio::select! {
            received = outcomes.recv() => match received {
                Ok(outcome) => {
                    if waiting.remove(&outcome.job_id) {
                        failed += report_outcome(&outcome, json)?;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} job outcome(s)", n),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                warn!("Interrupted, cancelling {} job(s)...", waiting.len());
                queue.stop().await;
                while let Ok(outcome) = outcomes.try_recv() {
                    if waiting.remove(&outcome.job_id) {
                        failed += report_outcome(&outcome, json)?;
                    }
                }
                failed += waiting.len();
                waiting.clear();
            }
        }
    }

    queue.stop().await;

    if failed + skipped > 0 {
        anyhow::bail!("{} job(s) failed, {} file(s) skipped", failed, skipped);
    }
    Ok(())
}

/// Log one outcome; returns 1 if it failed
fn report_outcome(outcome: &JobOutcome, json: bool) -> Result<usize> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    }
    if outcome.succeeded() {
        info!(
            "✅ Job {} completed: {} (token {})",
            outcome.job_id,
            outcome.display_name,
            outcome.token.as_deref().unwrap_or("-")
        );
        Ok(0)
    } else {
        warn!(
            "❌ Job {} failed: {}",
            outcome.job_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
        Ok(1)
    }
}
