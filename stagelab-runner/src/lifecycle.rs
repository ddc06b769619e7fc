//! Job and batch lifecycle state machines.
//!
//! Pause/cancel requests arrive as flags; the status itself only moves along
//! the edges below, and every move goes through `transition`.
//!
//! ```text
//! Job:    Init → Running → Completed
//!                Running → Paused | Failed | Cancelled
//!                Paused | Failed → Running
//! Batch:  Running → Paused | Cancelled | Completed
//!         Paused → Running | Cancelled
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {machine} transition: {from} → {to}")]
pub struct TransitionError {
    pub machine: &'static str,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Init,
    Running,
    Paused,
    Failed,
    Cancelled,
    Completed,
}

impl JobStatus {
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Init, Running)
                | (Running, Paused)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Paused, Running)
                | (Failed, Running)
        )
    }

    pub fn transition(self, to: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError {
                machine: "job",
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Completed)
    }

    /// Interrupted work an operator may resume.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            JobStatus::Init | JobStatus::Running | JobStatus::Paused | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Init => "init",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl BatchStatus {
    pub fn can_transition(self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Running, Paused)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn transition(self, to: BatchStatus) -> Result<BatchStatus, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError {
                machine: "batch",
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Cancelled | BatchStatus::Completed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}
