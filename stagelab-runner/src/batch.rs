//! Batch orchestration — one staged optimization per target, sequentially.
//!
//! For each target the orchestrator:
//! 1. checks the batch's pause/cancel requests (between targets only)
//! 2. skips the target if the result sink already holds it
//! 3. optimizes it under its own job id `"{batch}:{target}"`, so per-target
//!    checkpoints let a resumed batch continue mid-target work
//! 4. hands the optimum to the sink, or records the error and moves on
//!
//! Batch state lives in a `BatchRegistry`, which answers progress queries
//! from other threads while the batch runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{info, warn};

use stagelab_core::{JobId, ParameterSchema, PriceSeries, StageOptions};

use crate::config::{JobSpec, OptimizerConfig};
use crate::lifecycle::{BatchStatus, TransitionError};
use crate::optimizer::{JobControl, JobRequest, SequentialOptimizer};
use crate::signals::SignalSource;
use crate::sink::{ResultSink, SinkKey};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("unknown batch {0}")]
    UnknownJob(JobId),
    #[error("batch {0} is already running")]
    Busy(JobId),
    #[error("batch {job_id} is {status} and cannot run again")]
    Terminal { job_id: JobId, status: BatchStatus },
    #[error("lifecycle error: {0}")]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TargetStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TargetStatus::Succeeded | TargetStatus::Failed | TargetStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetError {
    pub target: String,
    pub error: String,
}

/// Mutable record of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: JobId,
    pub targets: Vec<(String, TargetStatus)>,
    pub status: BatchStatus,
    pub errors: Vec<TargetError>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub current_target: Option<String>,
}

impl BatchJob {
    pub fn new(job_id: JobId, targets: &[String]) -> Self {
        Self {
            job_id,
            targets: targets
                .iter()
                .map(|t| (t.clone(), TargetStatus::Pending))
                .collect(),
            status: BatchStatus::Running,
            errors: Vec::new(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            started_at: Utc::now(),
            current_target: None,
        }
    }

    fn set_target(&mut self, target: &str, status: TargetStatus) {
        if let Some(entry) = self.targets.iter_mut().find(|(t, _)| t == target) {
            entry.1 = status;
        }
    }

    fn finish_target(&mut self, target: &str, status: TargetStatus) {
        self.set_target(target, status);
        self.processed += 1;
        match status {
            TargetStatus::Succeeded => self.succeeded += 1,
            TargetStatus::Failed => self.failed += 1,
            TargetStatus::Skipped => self.skipped += 1,
            TargetStatus::Pending | TargetStatus::Running => {}
        }
        self.current_target = None;
    }

    pub fn progress(&self, now: DateTime<Utc>) -> BatchProgress {
        let elapsed_sec = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        BatchProgress {
            job_id: self.job_id.clone(),
            status: self.status,
            processed: self.processed,
            total: self.targets.len(),
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            errors: self.errors.clone(),
            elapsed_sec,
            estimated_remaining_sec: estimate_remaining(
                elapsed_sec,
                self.processed,
                self.targets.len(),
            ),
            current_target: self.current_target.clone(),
        }
    }
}

/// Progress snapshot as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub job_id: JobId,
    pub status: BatchStatus,
    pub processed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<TargetError>,
    pub elapsed_sec: f64,
    pub estimated_remaining_sec: Option<f64>,
    pub current_target: Option<String>,
}

/// `elapsed / processed × (total − processed)`, once something was processed.
pub fn estimate_remaining(elapsed_sec: f64, processed: usize, total: usize) -> Option<f64> {
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    Some(elapsed_sec / processed as f64 * remaining as f64)
}

/// Shared batch state keyed by job id.
#[derive(Default)]
pub struct BatchRegistry {
    jobs: Mutex<HashMap<JobId, BatchJob>>,
    controls: Mutex<HashMap<JobId, Arc<JobControl>>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, BatchJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn control(&self, job_id: &JobId) -> Arc<JobControl> {
        let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(controls.entry(job_id.clone()).or_default())
    }

    pub fn get(&self, job_id: &JobId) -> Option<BatchJob> {
        self.jobs().get(job_id).cloned()
    }

    pub fn progress(&self, job_id: &JobId) -> Option<BatchProgress> {
        self.jobs().get(job_id).map(|job| job.progress(Utc::now()))
    }

    /// Ask a running batch to pause after its current target.
    pub fn request_pause(&self, job_id: &JobId) -> Result<(), BatchError> {
        let status = self
            .jobs()
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| BatchError::UnknownJob(job_id.clone()))?;
        status.transition(BatchStatus::Paused)?;
        self.control(job_id).request_pause();
        Ok(())
    }

    /// Cancel a batch. A paused batch is cancelled at once; a running one
    /// stops after its current target.
    pub fn request_cancel(&self, job_id: &JobId) -> Result<(), BatchError> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| BatchError::UnknownJob(job_id.clone()))?;
        let next = job.status.transition(BatchStatus::Cancelled)?;
        if job.status == BatchStatus::Paused {
            job.status = next;
            info!(batch = %job_id, "paused batch cancelled");
        } else {
            self.control(job_id).request_cancel();
        }
        Ok(())
    }

    /// Register a new run or reopen a paused one.
    fn begin(&self, job_id: &JobId, targets: &[String]) -> Result<(), BatchError> {
        let mut jobs = self.jobs();
        match jobs.get_mut(job_id) {
            None => {
                jobs.insert(job_id.clone(), BatchJob::new(job_id.clone(), targets));
            }
            Some(job) if job.status.is_terminal() => {
                return Err(BatchError::Terminal {
                    job_id: job_id.clone(),
                    status: job.status,
                });
            }
            Some(job) if job.status == BatchStatus::Running => {
                return Err(BatchError::Busy(job_id.clone()));
            }
            Some(job) => {
                job.status = job.status.transition(BatchStatus::Running)?;
                info!(batch = %job_id, processed = job.processed, "batch resumed");
            }
        }
        self.control(job_id).clear();
        Ok(())
    }

    fn update<R>(&self, job_id: &JobId, f: impl FnOnce(&mut BatchJob) -> R) -> Option<R> {
        self.jobs().get_mut(job_id).map(f)
    }
}

/// Candles and signal source for one target.
pub struct PreparedTarget {
    pub source: Arc<dyn SignalSource>,
    pub fine: Arc<PriceSeries>,
}

/// Supplies per-target inputs to a batch.
pub trait TargetProvider: Send + Sync {
    fn prepare(&self, target: &str) -> anyhow::Result<PreparedTarget>;
}

/// What every target of a batch shares.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub strategy: String,
    pub period: String,
    pub schema: ParameterSchema,
    pub options: StageOptions,
    pub optimizer: OptimizerConfig,
}

impl BatchConfig {
    pub fn from_spec(spec: &JobSpec) -> Self {
        Self {
            strategy: spec.strategy.clone(),
            period: spec.period.clone(),
            schema: spec.schema.clone(),
            options: spec.stage_options(),
            optimizer: spec.optimizer.clone(),
        }
    }

    fn request_for(&self, batch: &JobId, target: &str) -> JobRequest {
        JobRequest {
            job_id: batch.child(target),
            schema: self.schema.clone(),
            options: self.options.clone(),
            config: self.optimizer.clone(),
        }
    }

    fn sink_key(&self, target: &str) -> SinkKey {
        SinkKey::new(&self.strategy, target, &self.period)
    }
}

enum TargetOutcome {
    Succeeded,
    Skipped,
    Failed(String),
}

/// Drives the optimizer across a batch's targets.
pub struct BatchOrchestrator {
    optimizer: Arc<SequentialOptimizer>,
    registry: Arc<BatchRegistry>,
    sink: Arc<dyn ResultSink>,
    provider: Arc<dyn TargetProvider>,
}

impl BatchOrchestrator {
    pub fn new(
        optimizer: Arc<SequentialOptimizer>,
        registry: Arc<BatchRegistry>,
        sink: Arc<dyn ResultSink>,
        provider: Arc<dyn TargetProvider>,
    ) -> Self {
        Self {
            optimizer,
            registry,
            sink,
            provider,
        }
    }

    pub fn registry(&self) -> &Arc<BatchRegistry> {
        &self.registry
    }

    /// Run a batch to completion, pause or cancellation.
    ///
    /// Re-invoking with the id of a paused batch runs only its unfinished targets.
    pub fn run_batch(
        &self,
        job_id: &JobId,
        targets: &[String],
        config: &BatchConfig,
    ) -> Result<BatchProgress, BatchError> {
        self.registry.begin(job_id, targets)?;
        let control = self.registry.control(job_id);
        let pending: Vec<String> = self
            .registry
            .get(job_id)
            .map(|job| {
                job.targets
                    .iter()
                    .filter(|(_, status)| !status.is_finished())
                    .map(|(t, _)| t.clone())
                    .collect()
            })
            .unwrap_or_default();

        info!(batch = %job_id, targets = pending.len(), strategy = %config.strategy, "batch started");

        for target in &pending {
            if control.cancel_requested() || control.pause_requested() {
                let to = if control.cancel_requested() {
                    BatchStatus::Cancelled
                } else {
                    BatchStatus::Paused
                };
                self.registry
                    .update(job_id, |job| job.status.transition(to).map(|s| job.status = s))
                    .ok_or_else(|| BatchError::UnknownJob(job_id.clone()))??;
                info!(batch = %job_id, status = %to, "batch stopped between targets");
                return self.snapshot(job_id);
            }

            self.registry.update(job_id, |job| {
                job.current_target = Some(target.clone());
                job.set_target(target, TargetStatus::Running);
            });

            let (status, error) = match self.process_target(job_id, target, config) {
                TargetOutcome::Succeeded => (TargetStatus::Succeeded, None),
                TargetOutcome::Skipped => (TargetStatus::Skipped, None),
                TargetOutcome::Failed(error) => (TargetStatus::Failed, Some(error)),
            };
            match &error {
                Some(e) => warn!(batch = %job_id, symbol = %target, error = %e, "target failed"),
                None => info!(batch = %job_id, symbol = %target, status = ?status, "target finished"),
            }
            self.registry.update(job_id, |job| {
                if let Some(error) = error {
                    job.errors.push(TargetError {
                        target: target.clone(),
                        error,
                    });
                }
                job.finish_target(target, status);
            });
        }

        self.registry
            .update(job_id, |job| {
                job.status
                    .transition(BatchStatus::Completed)
                    .map(|s| job.status = s)
            })
            .ok_or_else(|| BatchError::UnknownJob(job_id.clone()))??;
        let progress = self.snapshot(job_id)?;
        info!(
            batch = %job_id,
            succeeded = progress.succeeded,
            failed = progress.failed,
            skipped = progress.skipped,
            "batch completed"
        );
        Ok(progress)
    }

    fn process_target(&self, job_id: &JobId, target: &str, config: &BatchConfig) -> TargetOutcome {
        let key = config.sink_key(target);
        match self.sink.exists(&key) {
            Ok(true) => return TargetOutcome::Skipped,
            Ok(false) => {}
            Err(e) => return TargetOutcome::Failed(format!("result sink: {e}")),
        }

        let prepared = match self.provider.prepare(target) {
            Ok(prepared) => prepared,
            Err(e) => return TargetOutcome::Failed(format!("prepare {target}: {e:#}")),
        };

        let request = config.request_for(job_id, target);
        let outcome = match self.optimizer.run(
            &request,
            prepared.source.as_ref(),
            prepared.fine.as_ref(),
            &JobControl::new(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => return TargetOutcome::Failed(e.to_string()),
        };
        if !outcome.is_completed() {
            return TargetOutcome::Failed(format!("optimizer stopped with status {}", outcome.status));
        }

        match self
            .sink
            .accept_result(&key, &outcome.best_params, outcome.best_metrics.as_ref())
        {
            Ok(_) => TargetOutcome::Succeeded,
            Err(e) => TargetOutcome::Failed(format!("result sink: {e}")),
        }
    }

    fn snapshot(&self, job_id: &JobId) -> Result<BatchProgress, BatchError> {
        self.registry
            .progress(job_id)
            .ok_or_else(|| BatchError::UnknownJob(job_id.clone()))
    }
}

/// Run a batch on a named background thread.
pub fn spawn_batch(
    orchestrator: Arc<BatchOrchestrator>,
    job_id: JobId,
    targets: Vec<String>,
    config: BatchConfig,
) -> io::Result<JoinHandle<Result<BatchProgress, BatchError>>> {
    thread::Builder::new()
        .name(format!("stagelab-batch-{job_id}"))
        .spawn(move || orchestrator.run_batch(&job_id, &targets, &config))
}
