//! Progress events and the per-job event bus.
//!
//! The optimizer publishes; any number of observers subscribe per job id (or
//! to every job). Events are broadcast under the bus lock, so every observer
//! of a job sees them in generation order. A new observer first receives a
//! `state_sync` snapshot of where the job stands.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use stagelab_core::{JobId, ParamSet};

use crate::checkpoint::TrialSummary;
use crate::lifecycle::JobStatus;
use crate::metrics::PerformanceMetrics;

/// Events kept per job for late diagnostics.
pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;

/// Wire-level progress event, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TestComplete {
        job_id: JobId,
        stage: usize,
        test_number: usize,
        total_tests: usize,
        progress_pct: f64,
        params: ParamSet,
        #[serde(default)]
        metrics: Option<PerformanceMetrics>,
    },
    StageComplete {
        job_id: JobId,
        stage: usize,
        stage_name: String,
        /// Winning values of the parameters under test.
        best_value: ParamSet,
        #[serde(default)]
        best_metrics: Option<PerformanceMetrics>,
        all_results: Vec<TrialSummary>,
    },
    ProgressUpdate {
        job_id: JobId,
        current_stage: usize,
        total_stages: usize,
        overall_progress_pct: f64,
        status: JobStatus,
    },
    Error {
        job_id: JobId,
        error: String,
        #[serde(default)]
        stage: Option<usize>,
    },
    StateSync {
        job_id: JobId,
        state: JobSnapshot,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            ProgressEvent::TestComplete { job_id, .. }
            | ProgressEvent::StageComplete { job_id, .. }
            | ProgressEvent::ProgressUpdate { job_id, .. }
            | ProgressEvent::Error { job_id, .. }
            | ProgressEvent::StateSync { job_id, .. } => job_id,
        }
    }
}

/// Latest known state of a job, as folded from its events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub current_stage: usize,
    pub total_stages: usize,
    pub overall_progress_pct: f64,
    pub tests_completed: usize,
    pub stages_completed: usize,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobSnapshot {
    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TestComplete { progress_pct, .. } => {
                self.tests_completed += 1;
                self.overall_progress_pct = *progress_pct;
            }
            ProgressEvent::StageComplete { stage, .. } => {
                self.stages_completed = stage + 1;
            }
            ProgressEvent::ProgressUpdate {
                current_stage,
                total_stages,
                overall_progress_pct,
                status,
                ..
            } => {
                self.current_stage = *current_stage;
                self.total_stages = *total_stages;
                self.overall_progress_pct = *overall_progress_pct;
                self.status = *status;
            }
            ProgressEvent::Error { error, .. } => {
                self.last_error = Some(error.clone());
            }
            ProgressEvent::StateSync { state, .. } => *self = state.clone(),
        }
    }
}

#[derive(Default)]
struct BusState {
    observers: HashMap<JobId, Vec<Sender<ProgressEvent>>>,
    global: Vec<Sender<ProgressEvent>>,
    snapshots: HashMap<JobId, JobSnapshot>,
    history: HashMap<JobId, VecDeque<ProgressEvent>>,
}

/// Publish/subscribe fan-out of progress events, keyed by job id.
pub struct EventBus {
    state: Mutex<BusState>,
    history_limit: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            history_limit,
        }
    }

    // A panicking observer thread cannot corrupt plain collections.
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach an observer to one job. It first receives a `state_sync`.
    pub fn subscribe(&self, job_id: &JobId) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        let mut state = self.lock();
        let snapshot = state.snapshots.get(job_id).cloned().unwrap_or_default();
        let _ = tx.send(ProgressEvent::StateSync {
            job_id: job_id.clone(),
            state: snapshot,
        });
        state.observers.entry(job_id.clone()).or_default().push(tx);
        rx
    }

    /// Attach an observer to every job.
    pub fn subscribe_all(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().global.push(tx);
        rx
    }

    /// Broadcast an event. Observers whose receiver was dropped are removed.
    pub fn publish(&self, event: ProgressEvent) {
        let mut state = self.lock();
        let job_id = event.job_id().clone();

        state
            .snapshots
            .entry(job_id.clone())
            .or_default()
            .apply(&event);

        if let Some(observers) = state.observers.get_mut(&job_id) {
            observers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        state.global.retain(|tx| tx.send(event.clone()).is_ok());

        if self.history_limit > 0 {
            let history = state.history.entry(job_id).or_default();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event);
        }
    }

    pub fn snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.lock().snapshots.get(job_id).cloned()
    }

    /// Recent events of a job, oldest first.
    pub fn history(&self, job_id: &JobId) -> Vec<ProgressEvent> {
        self.lock()
            .history
            .get(job_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn observer_count(&self, job_id: &JobId) -> usize {
        self.lock().observers.get(job_id).map_or(0, |o| o.len())
    }
}
