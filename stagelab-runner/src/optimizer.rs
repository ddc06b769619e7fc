//! Sequential staged optimizer.
//!
//! Runs a stage plan one stage at a time. Each stage evaluates every
//! candidate of its grid (defaults ⊕ earlier winners ⊕ values under test)
//! through the signal source and the execution simulator, keeps the best by
//! the job's selection rule, and locks the winner before the next stage.
//!
//! Progress is checkpointed after every candidate and every stage boundary,
//! so a paused or crashed job resumes exactly where it stopped. Pause and
//! cancel requests are honoured only between stages.

use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use stagelab_core::{
    build_stages, simulate, JobId, ParamSet, ParameterSchema, PriceSeries, SchemaError,
    SimulationError, Stage, StageOptions, StagePlan,
};

use crate::checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, ResumeMismatch, StageResult, TrialSummary,
};
use crate::config::{JobSpec, OptimizerConfig};
use crate::events::{EventBus, ProgressEvent};
use crate::lifecycle::{JobStatus, TransitionError};
use crate::metrics::PerformanceMetrics;
use crate::signals::{SignalError, SignalSource};

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("job {0} is already running")]
    JobBusy(JobId),
    #[error("job {0} was cancelled and cannot be resumed")]
    Cancelled(JobId),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("lifecycle error: {0}")]
    Transition(#[from] TransitionError),
    #[error(
        "job {job_id} failed in stage {stage}: {failures} of {stage_size} candidates failed, last error: {last_error}"
    )]
    ErrorRateExceeded {
        job_id: JobId,
        stage: usize,
        failures: usize,
        stage_size: usize,
        last_error: String,
    },
    #[error("thread pool: {0}")]
    ThreadPool(String),
}

/// Why a single candidate could not be scored.
#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("signal source: {0}")]
    Signal(#[from] SignalError),
    #[error("simulation: {0}")]
    Simulation(#[from] SimulationError),
    #[error("signal source panicked: {0}")]
    Panic(String),
}

/// Pause/cancel requests for a running job.
#[derive(Debug, Default)]
pub struct JobControl {
    pause: AtomicBool,
    cancel: AtomicBool,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Drop pending requests, e.g. before resuming.
    pub fn clear(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// Everything that identifies one optimization job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub schema: ParameterSchema,
    pub options: StageOptions,
    pub config: OptimizerConfig,
}

impl JobRequest {
    pub fn new(job_id: JobId, schema: ParameterSchema, config: OptimizerConfig) -> Self {
        Self {
            job_id,
            schema,
            options: StageOptions::default(),
            config,
        }
    }

    pub fn with_options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn from_spec(spec: &JobSpec) -> Self {
        Self {
            job_id: spec.job_id.clone(),
            schema: spec.schema.clone(),
            options: spec.stage_options(),
            config: spec.optimizer.clone(),
        }
    }
}

/// How a run related to previously stored progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeInfo {
    Fresh,
    Resumed { stage: usize, test: usize },
    /// The stored checkpoint did not match the plan and was discarded.
    Restarted { reason: String },
    AlreadyCompleted,
}

/// Result of one `run` call. `status` is `Completed`, `Paused` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Defaults overlaid with every locked winner so far.
    pub best_params: ParamSet,
    /// Metrics of the most recent stage winner.
    pub best_metrics: Option<PerformanceMetrics>,
    pub best_per_stage: BTreeMap<usize, StageResult>,
    pub stages_completed: usize,
    pub total_stages: usize,
    pub resume: ResumeInfo,
}

impl JobOutcome {
    fn from_checkpoint(plan: &StagePlan, cp: &Checkpoint, resume: ResumeInfo) -> Self {
        let mut best_params = plan.defaults().clone();
        best_params.extend(cp.locked_params.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            job_id: cp.job_id.clone(),
            status: cp.status,
            best_params,
            best_metrics: cp.best_per_stage.values().last().map(|r| r.metrics.clone()),
            best_per_stage: cp.best_per_stage.clone(),
            stages_completed: cp.current_stage_index,
            total_stages: plan.len(),
            resume,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Releases the job lease on drop.
struct Lease<'a> {
    held: &'a Mutex<HashSet<JobId>>,
    job_id: JobId,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.job_id);
    }
}

/// Runs staged searches, one thread per job, with checkpointed progress.
pub struct SequentialOptimizer {
    store: Arc<dyn CheckpointStore>,
    bus: Arc<EventBus>,
    leases: Mutex<HashSet<JobId>>,
}

impl SequentialOptimizer {
    pub fn new(store: Arc<dyn CheckpointStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            leases: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn acquire(&self, job_id: &JobId) -> Result<Lease<'_>, OptimizerError> {
        let mut held = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(job_id.clone()) {
            return Err(OptimizerError::JobBusy(job_id.clone()));
        }
        Ok(Lease {
            held: &self.leases,
            job_id: job_id.clone(),
        })
    }

    /// Run (or resume) a job until it completes, pauses, is cancelled or fails.
    pub fn run(
        &self,
        request: &JobRequest,
        source: &dyn SignalSource,
        fine: &PriceSeries,
        control: &JobControl,
    ) -> Result<JobOutcome, OptimizerError> {
        let _lease = self.acquire(&request.job_id)?;
        let job_id = &request.job_id;

        let plan = build_stages(&request.schema, &request.options)?;
        let fingerprint = plan.fingerprint();
        let config_fingerprint = request.config.fingerprint();
        let fresh = || {
            Checkpoint::new(job_id.clone(), fingerprint.clone())
                .with_config_fingerprint(config_fingerprint.clone())
        };

        let stored = match self.store.load(job_id) {
            Ok(stored) => Ok(stored),
            Err(CheckpointError::Corrupt { path, reason }) => {
                warn!(job = %job_id, path = %path.display(), reason = %reason, "stored checkpoint unreadable");
                Err(ResumeMismatch::Unreadable(reason))
            }
            Err(e) => return Err(e.into()),
        };

        let (mut cp, resume) = match stored {
            Err(mismatch) => {
                let reason = mismatch.to_string();
                (fresh(), ResumeInfo::Restarted { reason })
            }
            Ok(Some(cp)) if cp.status == JobStatus::Cancelled => {
                return Err(OptimizerError::Cancelled(job_id.clone()));
            }
            Ok(Some(cp)) => match cp
                .validate_against(&plan)
                .and_then(|()| cp.validate_config(&config_fingerprint))
            {
                Ok(()) if cp.status == JobStatus::Completed => {
                    info!(job = %job_id, "job already completed, returning stored result");
                    return Ok(JobOutcome::from_checkpoint(
                        &plan,
                        &cp,
                        ResumeInfo::AlreadyCompleted,
                    ));
                }
                Ok(()) => {
                    let resume = ResumeInfo::Resumed {
                        stage: cp.current_stage_index,
                        test: cp.tests_completed_in_stage,
                    };
                    (cp, resume)
                }
                Err(mismatch) => {
                    warn!(job = %job_id, reason = %mismatch, "checkpoint does not match job, restarting");
                    let reason = mismatch.to_string();
                    (fresh(), ResumeInfo::Restarted { reason })
                }
            },
            Ok(None) => (fresh(), ResumeInfo::Fresh),
        };

        match cp.status {
            // A crashed run left `Running` behind; carry on from its progress.
            JobStatus::Running => {}
            JobStatus::Failed => {
                cp.status = cp.status.transition(JobStatus::Running)?;
                cp.stage_failures = 0;
                cp.last_error = None;
            }
            status => cp.status = status.transition(JobStatus::Running)?,
        }
        self.save(&mut cp)?;

        info!(
            job = %job_id,
            fingerprint = %fingerprint.short(),
            stages = plan.len(),
            tests = plan.total_tests(),
            resume = ?resume,
            "optimizer job started"
        );
        self.emit_progress(&plan, &cp);

        while cp.current_stage_index < plan.len() {
            let stage_index = cp.current_stage_index;

            if cp.tests_completed_in_stage == 0 {
                if control.cancel_requested() {
                    cp.status = cp.status.transition(JobStatus::Cancelled)?;
                    self.save(&mut cp)?;
                    self.emit_progress(&plan, &cp);
                    info!(job = %job_id, stage = stage_index, "job cancelled");
                    return Ok(JobOutcome::from_checkpoint(&plan, &cp, resume));
                }
                if control.pause_requested() {
                    cp.status = cp.status.transition(JobStatus::Paused)?;
                    self.save(&mut cp)?;
                    self.emit_progress(&plan, &cp);
                    info!(job = %job_id, stage = stage_index, "job paused");
                    return Ok(JobOutcome::from_checkpoint(&plan, &cp, resume));
                }
            }

            let Some(stage) = plan.get(stage_index) else {
                break;
            };
            self.run_stage(request, &plan, stage, source, fine, &mut cp)?;
            self.finish_stage(&plan, stage, &mut cp)?;
        }

        cp.status = cp.status.transition(JobStatus::Completed)?;
        self.save(&mut cp)?;
        self.emit_progress(&plan, &cp);
        info!(job = %job_id, stages = plan.len(), "job completed");
        Ok(JobOutcome::from_checkpoint(&plan, &cp, resume))
    }

    fn run_stage(
        &self,
        request: &JobRequest,
        plan: &StagePlan,
        stage: &Stage,
        source: &dyn SignalSource,
        fine: &PriceSeries,
        cp: &mut Checkpoint,
    ) -> Result<(), OptimizerError> {
        let rule = request.config.selection();
        let mut base = plan.defaults().clone();
        base.extend(cp.locked_params.iter().map(|(k, v)| (k.clone(), *v)));

        debug!(job = %cp.job_id, stage = stage.index, name = %stage.name, size = stage.len(), "stage started");

        for test_index in cp.tests_completed_in_stage..stage.len() {
            let Some(candidate) = stage.candidate(test_index, &base) else {
                break;
            };
            let test_number = test_index + 1;

            let metrics = match evaluate(&request.config, source, fine, &candidate) {
                Ok(metrics) => {
                    let incumbent = cp.stage_best.as_ref().map(|b| &b.metrics);
                    if rule.beats(&metrics, incumbent) {
                        cp.stage_best = Some(StageResult {
                            params: candidate.clone(),
                            metrics: metrics.clone(),
                        });
                    }
                    cp.stage_results.push(TrialSummary {
                        test_number,
                        params: candidate.clone(),
                        metrics: Some(metrics.clone()),
                        error: None,
                    });
                    Some(metrics)
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(job = %cp.job_id, stage = stage.index, test = test_number, error = %message, "candidate failed");
                    cp.stage_failures += 1;
                    cp.last_error = Some(message.clone());
                    cp.stage_results.push(TrialSummary {
                        test_number,
                        params: candidate.clone(),
                        metrics: None,
                        error: Some(message.clone()),
                    });
                    self.bus.publish(ProgressEvent::Error {
                        job_id: cp.job_id.clone(),
                        error: message,
                        stage: Some(stage.index),
                    });
                    None
                }
            };
            cp.tests_completed_in_stage = test_number;

            if cp.stage_failures as f64 > request.config.max_error_rate * stage.len() as f64 {
                cp.status = cp.status.transition(JobStatus::Failed)?;
                self.save(cp)?;
                self.emit_progress(plan, cp);
                let last_error = cp.last_error.clone().unwrap_or_default();
                warn!(job = %cp.job_id, stage = stage.index, failures = cp.stage_failures, "error rate exceeded, job failed");
                return Err(OptimizerError::ErrorRateExceeded {
                    job_id: cp.job_id.clone(),
                    stage: stage.index,
                    failures: cp.stage_failures,
                    stage_size: stage.len(),
                    last_error,
                });
            }

            self.save(cp)?;
            let done = plan.tests_before(stage.index) + test_number;
            self.bus.publish(ProgressEvent::TestComplete {
                job_id: cp.job_id.clone(),
                stage: stage.index,
                test_number,
                total_tests: stage.len(),
                progress_pct: percent(done, plan.total_tests()),
                params: candidate,
                metrics,
            });
        }
        Ok(())
    }

    /// Lock the stage winner (or the defaults when nothing qualified) and advance.
    fn finish_stage(
        &self,
        plan: &StagePlan,
        stage: &Stage,
        cp: &mut Checkpoint,
    ) -> Result<(), OptimizerError> {
        let best = cp.stage_best.clone();
        let winner = match &best {
            Some(best) => stage.under_test(&best.params),
            None => {
                warn!(job = %cp.job_id, stage = stage.index, "no eligible candidate, locking defaults");
                stage.under_test(plan.defaults())
            }
        };

        info!(
            job = %cp.job_id,
            stage = stage.index,
            name = %stage.name,
            winner = ?winner,
            score = ?best.as_ref().map(|b| b.metrics.clone()),
            "stage complete"
        );

        cp.locked_params
            .extend(winner.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(best) = &best {
            cp.best_per_stage.insert(stage.index, best.clone());
        }
        let all_results = std::mem::take(&mut cp.stage_results);
        cp.advance_stage();
        self.save(cp)?;

        self.bus.publish(ProgressEvent::StageComplete {
            job_id: cp.job_id.clone(),
            stage: stage.index,
            stage_name: stage.name.clone(),
            best_value: winner,
            best_metrics: best.map(|b| b.metrics),
            all_results,
        });
        self.emit_progress(plan, cp);
        Ok(())
    }

    fn save(&self, cp: &mut Checkpoint) -> Result<(), OptimizerError> {
        cp.touch();
        self.store.save(cp)?;
        Ok(())
    }

    fn emit_progress(&self, plan: &StagePlan, cp: &Checkpoint) {
        let done = plan.tests_before(cp.current_stage_index) + cp.tests_completed_in_stage;
        self.bus.publish(ProgressEvent::ProgressUpdate {
            job_id: cp.job_id.clone(),
            current_stage: cp.current_stage_index,
            total_stages: plan.len(),
            overall_progress_pct: percent(done, plan.total_tests()),
            status: cp.status,
        });
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

/// Score one candidate: signals → trades → metrics.
pub fn evaluate(
    config: &OptimizerConfig,
    source: &dyn SignalSource,
    fine: &PriceSeries,
    params: &ParamSet,
) -> Result<PerformanceMetrics, CandidateError> {
    let frame = panic::catch_unwind(AssertUnwindSafe(|| source.generate_signals(params)))
        .map_err(|payload| CandidateError::Panic(panic_message(payload.as_ref())))??;
    let trades = simulate(
        &frame.signals,
        &frame.coarse,
        fine,
        &config.simulation_config(params),
    )?;
    Ok(PerformanceMetrics::compute(&trades))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One independent job for `run_jobs_parallel`.
pub struct ParallelJob {
    pub request: JobRequest,
    pub source: Arc<dyn SignalSource>,
    pub fine: Arc<PriceSeries>,
    pub control: Arc<JobControl>,
}

/// Run independent jobs (distinct ids) concurrently on a private rayon pool.
///
/// Results come back in input order. `threads == 0` lets rayon choose.
pub fn run_jobs_parallel(
    optimizer: &SequentialOptimizer,
    jobs: &[ParallelJob],
    threads: usize,
) -> Result<Vec<Result<JobOutcome, OptimizerError>>, OptimizerError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("stagelab-job-{i}"))
        .build()
        .map_err(|e| OptimizerError::ThreadPool(e.to_string()))?;

    Ok(pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                optimizer.run(
                    &job.request,
                    job.source.as_ref(),
                    job.fine.as_ref(),
                    job.control.as_ref(),
                )
            })
            .collect()
    }))
}
