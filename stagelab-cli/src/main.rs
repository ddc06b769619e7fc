//! StageLab CLI — stage plans, optimizer jobs and batches.
//!
//! Commands:
//! - `stages` — print the stage plan a job file produces
//! - `optimize` — run (or resume) one optimizer job per target, in parallel
//! - `batch` — optimize targets sequentially into a JSONL result sink
//! - `incomplete` — list checkpoints that can be resumed

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stagelab_core::build_stages;
use stagelab_runner::{
    load_target, run_jobs_parallel, BatchConfig, BatchOrchestrator, BatchRegistry,
    CheckpointStore, DataSpec, EventBus, JobControl, JobRequest, JobSpec,
    JsonFileCheckpointStore, JsonlResultSink, MaCrossSource, ParallelJob, PreparedTarget,
    SequentialOptimizer, TargetProvider,
};

#[derive(Parser)]
#[command(
    name = "stagelab",
    about = "StageLab CLI — staged, resumable parameter optimization"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stage plan of a job file.
    Stages {
        /// Path to a TOML job file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run or resume one optimizer job per target.
    Optimize {
        /// Path to a TOML job file.
        #[arg(long)]
        config: PathBuf,

        /// Targets to optimize. Defaults to the job file's targets.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Checkpoint directory. Defaults to ./checkpoints.
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: PathBuf,

        /// Worker threads (0 = one per core).
        #[arg(long, default_value_t = 0)]
        threads: usize,

        /// First day of synthetic data (YYYY-MM-DD).
        #[arg(long, default_value = "2024-01-01")]
        start: String,

        /// Print progress events as JSON lines on stdout.
        #[arg(long, default_value_t = false)]
        events: bool,
    },
    /// Optimize targets one after another into a result sink.
    Batch {
        /// Path to a TOML job file.
        #[arg(long)]
        config: PathBuf,

        /// Targets to optimize. Defaults to the job file's targets.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Checkpoint directory. Defaults to ./checkpoints.
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: PathBuf,

        /// JSONL file receiving accepted results.
        #[arg(long, default_value = "results/accepted.jsonl")]
        results: PathBuf,

        /// First day of synthetic data (YYYY-MM-DD).
        #[arg(long, default_value = "2024-01-01")]
        start: String,

        /// Print progress events as JSON lines on stdout.
        #[arg(long, default_value_t = false)]
        events: bool,
    },
    /// List paused, failed or interrupted jobs.
    Incomplete {
        /// Checkpoint directory. Defaults to ./checkpoints.
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stages { config } => run_stages(&config),
        Commands::Optimize {
            config,
            targets,
            checkpoint_dir,
            threads,
            start,
            events,
        } => run_optimize(&config, targets, &checkpoint_dir, threads, &start, events),
        Commands::Batch {
            config,
            targets,
            checkpoint_dir,
            results,
            start,
            events,
        } => run_batch_cmd(&config, targets, &checkpoint_dir, &results, &start, events),
        Commands::Incomplete { checkpoint_dir } => run_incomplete(&checkpoint_dir),
    }
}

fn load_spec(path: &Path) -> Result<JobSpec> {
    JobSpec::load(path).with_context(|| format!("loading job file {}", path.display()))
}

fn parse_start(start: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .with_context(|| format!("invalid --start '{start}', expected YYYY-MM-DD"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("start date has no midnight")?;
    Ok(midnight.and_utc())
}

fn resolve_targets(spec: &JobSpec, targets: Vec<String>) -> Result<Vec<String>> {
    let targets = if targets.is_empty() {
        spec.targets.clone()
    } else {
        targets
    };
    if targets.is_empty() {
        bail!("no targets: pass --target or list `targets` in the job file");
    }
    Ok(targets)
}

/// Drains every progress event onto stdout until the bus is dropped.
fn spawn_event_printer(bus: &EventBus) -> Result<JoinHandle<()>> {
    let rx = bus.subscribe_all();
    let handle = thread::Builder::new()
        .name("stagelab-events".into())
        .spawn(move || {
            for event in rx {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        })?;
    Ok(handle)
}

/// Candles from a job's `[data]` section, signals from an EMA crossover.
struct DataTargets {
    data: DataSpec,
    start: DateTime<Utc>,
}

impl TargetProvider for DataTargets {
    fn prepare(&self, target: &str) -> Result<PreparedTarget> {
        let loaded = load_target(&self.data, target, self.start)?;
        if loaded.synthetic {
            info!(symbol = target, candles = loaded.fine.len(), "using synthetic candles");
        }
        Ok(PreparedTarget {
            source: Arc::new(MaCrossSource::new(Arc::new(loaded.coarse))),
            fine: Arc::new(loaded.fine),
        })
    }
}

fn run_stages(config: &Path) -> Result<()> {
    let spec = load_spec(config)?;
    let plan = build_stages(&spec.schema, &spec.stage_options())?;

    println!("Job: {}", spec.job_id);
    println!("Fingerprint: {}", plan.fingerprint().short());
    println!();
    println!("{:<6} {:<32} {:>10}", "Stage", "Parameters", "Candidates");
    println!("{}", "-".repeat(50));
    for stage in plan.stages() {
        println!("{:<6} {:<32} {:>10}", stage.index, stage.name, stage.len());
    }
    println!("{}", "-".repeat(50));
    println!("{:<39} {:>10}", "Total", plan.total_tests());
    Ok(())
}

fn run_optimize(
    config: &Path,
    targets: Vec<String>,
    checkpoint_dir: &Path,
    threads: usize,
    start: &str,
    events: bool,
) -> Result<()> {
    let spec = load_spec(config)?;
    let targets = resolve_targets(&spec, targets)?;
    let provider = DataTargets {
        data: spec.data.clone(),
        start: parse_start(start)?,
    };

    let bus = Arc::new(EventBus::new());
    let printer = if events {
        Some(spawn_event_printer(&bus)?)
    } else {
        None
    };
    let store = Arc::new(JsonFileCheckpointStore::new(checkpoint_dir)?);
    let optimizer = SequentialOptimizer::new(store, Arc::clone(&bus));

    let base = JobRequest::from_spec(&spec);
    let mut jobs = Vec::with_capacity(targets.len());
    for target in &targets {
        let prepared = provider.prepare(target)?;
        jobs.push(ParallelJob {
            request: JobRequest {
                job_id: spec.job_id.child(target),
                ..base.clone()
            },
            source: prepared.source,
            fine: prepared.fine,
            control: Arc::new(JobControl::new()),
        });
    }

    let results = run_jobs_parallel(&optimizer, &jobs, threads)?;
    drop(optimizer);
    drop(bus);
    if let Some(printer) = printer {
        let _ = printer.join();
    }

    let mut failures = 0;
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(outcome) => {
                eprintln!(
                    "{target}: {} ({}/{} stages)",
                    outcome.status, outcome.stages_completed, outcome.total_stages
                );
                if !events {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("{target}: {e}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} jobs failed", targets.len());
    }
    Ok(())
}

fn run_batch_cmd(
    config: &Path,
    targets: Vec<String>,
    checkpoint_dir: &Path,
    results: &Path,
    start: &str,
    events: bool,
) -> Result<()> {
    let spec = load_spec(config)?;
    let targets = resolve_targets(&spec, targets)?;

    let bus = Arc::new(EventBus::new());
    let printer = if events {
        Some(spawn_event_printer(&bus)?)
    } else {
        None
    };
    let store = Arc::new(JsonFileCheckpointStore::new(checkpoint_dir)?);
    let orchestrator = BatchOrchestrator::new(
        Arc::new(SequentialOptimizer::new(store, Arc::clone(&bus))),
        Arc::new(BatchRegistry::new()),
        Arc::new(JsonlResultSink::new(results)),
        Arc::new(DataTargets {
            data: spec.data.clone(),
            start: parse_start(start)?,
        }),
    );

    let progress = orchestrator.run_batch(&spec.job_id, &targets, &BatchConfig::from_spec(&spec))?;
    drop(orchestrator);
    drop(bus);
    if let Some(printer) = printer {
        let _ = printer.join();
    }

    for error in &progress.errors {
        eprintln!("{}: {}", error.target, error.error);
    }
    eprintln!(
        "Batch {}: {} processed, {} succeeded, {} skipped, {} failed in {:.1}s",
        progress.job_id,
        progress.processed,
        progress.succeeded,
        progress.skipped,
        progress.failed,
        progress.elapsed_sec
    );
    eprintln!("Results: {}", results.display());
    if !events {
        println!("{}", serde_json::to_string_pretty(&progress)?);
    }
    Ok(())
}

fn run_incomplete(checkpoint_dir: &Path) -> Result<()> {
    if !checkpoint_dir.exists() {
        println!("Checkpoint directory does not exist: {}", checkpoint_dir.display());
        return Ok(());
    }
    let store = JsonFileCheckpointStore::new(checkpoint_dir)?;
    let incomplete = store.find_incomplete()?;
    if incomplete.is_empty() {
        println!("No incomplete jobs in {}", checkpoint_dir.display());
        return Ok(());
    }

    println!(
        "{:<32} {:<10} {:>6} {:>6}  {}",
        "Job", "Status", "Stage", "Test", "Updated"
    );
    println!("{}", "-".repeat(80));
    for cp in &incomplete {
        println!(
            "{:<32} {:<10} {:>6} {:>6}  {}",
            cp.job_id.as_str(),
            cp.status.to_string(),
            cp.current_stage_index,
            cp.tests_completed_in_stage,
            cp.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &cp.last_error {
            println!("    last error: {error}");
        }
    }
    Ok(())
}
