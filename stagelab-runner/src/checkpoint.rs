//! Checkpoints — durable, versioned job progress keyed by job id.
//!
//! The optimizer overwrites a job's checkpoint after every candidate and
//! every stage boundary. Two interchangeable backends:
//! - `InMemoryCheckpointStore` for tests and embedded use
//! - `JsonFileCheckpointStore`: one JSON file per job, written atomically
//!   (temp file + rename) so a crash never leaves a torn record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

use stagelab_core::{JobId, ParamSet, PlanFingerprint, StagePlan};

use crate::lifecycle::JobStatus;
use crate::metrics::PerformanceMetrics;

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint store lock poisoned")]
    Poisoned,
}

/// Why a stored checkpoint cannot be trusted against a freshly built plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeMismatch {
    #[error("checkpoint version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("stage plan changed (stored {stored}, current {current})")]
    Fingerprint { stored: String, current: String },
    #[error("optimizer settings changed (stored {stored}, current {current})")]
    Config { stored: String, current: String },
    #[error("unreadable checkpoint: {0}")]
    Unreadable(String),
    #[error("stage index {index} beyond plan of {stages} stages")]
    StageOutOfRange { index: usize, stages: usize },
    #[error("{completed} tests completed in stage {stage} of size {size}")]
    TestOutOfRange {
        stage: usize,
        completed: usize,
        size: usize,
    },
    #[error("locked parameter '{name}' does not belong to an earlier stage")]
    ForeignLock { name: String },
    #[error("best result recorded for unfinished stage {stage}")]
    PrematureBest { stage: usize },
}

/// Best candidate of a stage: the full assignment and its metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub params: ParamSet,
    pub metrics: PerformanceMetrics,
}

/// Summary of one evaluated candidate, kept for the stage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub test_number: usize,
    pub params: ParamSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PerformanceMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resumable job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage_plan_fingerprint: PlanFingerprint,
    /// Hash of the settings that score candidates. Empty on records that
    /// predate it, which then resume without the check.
    #[serde(default)]
    pub config_fingerprint: String,
    pub current_stage_index: usize,
    pub tests_completed_in_stage: usize,
    /// Winners of stages before `current_stage_index` only.
    pub locked_params: ParamSet,
    pub best_per_stage: BTreeMap<usize, StageResult>,
    /// Best so far in the current stage.
    #[serde(default)]
    pub stage_best: Option<StageResult>,
    #[serde(default)]
    pub stage_failures: usize,
    #[serde(default)]
    pub stage_results: Vec<TrialSummary>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: JobId, fingerprint: PlanFingerprint) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            job_id,
            status: JobStatus::Init,
            stage_plan_fingerprint: fingerprint,
            config_fingerprint: String::new(),
            current_stage_index: 0,
            tests_completed_in_stage: 0,
            locked_params: ParamSet::new(),
            best_per_stage: BTreeMap::new(),
            stage_best: None,
            stage_failures: 0,
            stage_results: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Check that this checkpoint describes progress through `plan`.
    pub fn validate_against(&self, plan: &StagePlan) -> Result<(), ResumeMismatch> {
        if self.version != CHECKPOINT_VERSION {
            return Err(ResumeMismatch::Version {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        let current = plan.fingerprint();
        if self.stage_plan_fingerprint != current {
            return Err(ResumeMismatch::Fingerprint {
                stored: self.stage_plan_fingerprint.short().to_string(),
                current: current.short().to_string(),
            });
        }
        if self.current_stage_index > plan.len() {
            return Err(ResumeMismatch::StageOutOfRange {
                index: self.current_stage_index,
                stages: plan.len(),
            });
        }
        let size = plan.get(self.current_stage_index).map_or(0, |s| s.len());
        if self.tests_completed_in_stage > size {
            return Err(ResumeMismatch::TestOutOfRange {
                stage: self.current_stage_index,
                completed: self.tests_completed_in_stage,
                size,
            });
        }
        let allowed = plan.parameters_before(self.current_stage_index);
        if let Some(name) = self.locked_params.keys().find(|k| !allowed.contains(*k)) {
            return Err(ResumeMismatch::ForeignLock { name: name.clone() });
        }
        if let Some(&stage) = self
            .best_per_stage
            .keys()
            .find(|&&s| s >= self.current_stage_index)
        {
            return Err(ResumeMismatch::PrematureBest { stage });
        }
        Ok(())
    }

    pub fn with_config_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.config_fingerprint = fingerprint.into();
        self
    }

    /// Check that the candidates were scored under the settings hashed as `current`.
    pub fn validate_config(&self, current: &str) -> Result<(), ResumeMismatch> {
        if self.config_fingerprint.is_empty() || self.config_fingerprint == current {
            return Ok(());
        }
        Err(ResumeMismatch::Config {
            stored: short(&self.config_fingerprint).to_string(),
            current: short(current).to_string(),
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Clear in-stage progress when moving to the next stage.
    pub fn advance_stage(&mut self) {
        self.current_stage_index += 1;
        self.tests_completed_in_stage = 0;
        self.stage_best = None;
        self.stage_failures = 0;
        self.stage_results.clear();
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// Durable key-value store for job progress.
///
/// Implementations serialize writes internally; the optimizer additionally
/// guarantees a single writer per job id.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, job_id: &JobId) -> Result<Option<Checkpoint>, CheckpointError>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    fn delete(&self, job_id: &JobId) -> Result<(), CheckpointError>;
    /// All readable checkpoints, ordered by job id.
    fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Interrupted, paused or failed jobs an operator may resume.
    fn find_incomplete(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|cp| cp.status.is_resumable())
            .collect())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: Mutex<BTreeMap<JobId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, job_id: &JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        let records = self.records.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(records.get(job_id).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut records = self.records.lock().map_err(|_| CheckpointError::Poisoned)?;
        records.insert(checkpoint.job_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn delete(&self, job_id: &JobId) -> Result<(), CheckpointError> {
        let mut records = self.records.lock().map_err(|_| CheckpointError::Poisoned)?;
        records.remove(job_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let records = self.records.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }
}

/// One pretty-printed JSON file per job under a directory.
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCheckpointStore {
    /// Open a store, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", job_id.file_stem()))
    }

    fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let json = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn load(&self, job_id: &JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint = Self::read(&path)?;
        if &checkpoint.job_id != job_id {
            return Err(CheckpointError::Corrupt {
                path,
                reason: format!("belongs to job '{}'", checkpoint.job_id),
            });
        }
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().map_err(|_| CheckpointError::Poisoned)?;
        let path = self.path_for(&checkpoint.job_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&tmp, json).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io { path, source })
    }

    fn delete(&self, job_id: &JobId) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().map_err(|_| CheckpointError::Poisoned)?;
        let path = self.path_for(job_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| CheckpointError::Io { path, source })?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut checkpoints = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json") {
                match Self::read(&path) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
                }
            }
        }
        checkpoints.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(checkpoints)
    }
}
