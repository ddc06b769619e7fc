//! Result sinks — where a batch delivers each target's accepted optimum.
//!
//! A sink is keyed by `(strategy, target, period)`. The batch asks `exists`
//! before optimizing a target and skips it on a match; `accept_result` never
//! stores the same key twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use stagelab_core::ParamSet;

use crate::metrics::PerformanceMetrics;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sink serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sink lock poisoned")]
    Poisoned,
}

/// Identity of an accepted result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkKey {
    pub strategy: String,
    pub target: String,
    pub period: String,
}

impl SinkKey {
    pub fn new(
        strategy: impl Into<String>,
        target: impl Into<String>,
        period: impl Into<String>,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            target: target.into(),
            period: period.into(),
        }
    }
}

/// One stored optimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedResult {
    #[serde(flatten)]
    pub key: SinkKey,
    pub params: ParamSet,
    #[serde(default)]
    pub metrics: Option<PerformanceMetrics>,
    pub accepted_at: DateTime<Utc>,
}

pub trait ResultSink: Send + Sync {
    fn exists(&self, key: &SinkKey) -> Result<bool, SinkError>;

    /// Store a result. Returns `Ok(false)` when the key was already present.
    fn accept_result(
        &self,
        key: &SinkKey,
        params: &ParamSet,
        metrics: Option<&PerformanceMetrics>,
    ) -> Result<bool, SinkError>;
}

fn accepted(key: &SinkKey, params: &ParamSet, metrics: Option<&PerformanceMetrics>) -> AcceptedResult {
    AcceptedResult {
        key: key.clone(),
        params: params.clone(),
        metrics: metrics.cloned(),
        accepted_at: Utc::now(),
    }
}

/// Process-local sink.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    results: Mutex<Vec<AcceptedResult>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<AcceptedResult> {
        self.results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ResultSink for InMemoryResultSink {
    fn exists(&self, key: &SinkKey) -> Result<bool, SinkError> {
        let results = self.results.lock().map_err(|_| SinkError::Poisoned)?;
        Ok(results.iter().any(|r| &r.key == key))
    }

    fn accept_result(
        &self,
        key: &SinkKey,
        params: &ParamSet,
        metrics: Option<&PerformanceMetrics>,
    ) -> Result<bool, SinkError> {
        let mut results = self.results.lock().map_err(|_| SinkError::Poisoned)?;
        if results.iter().any(|r| &r.key == key) {
            return Ok(false);
        }
        results.push(accepted(key, params, metrics));
        Ok(true)
    }
}

/// Append-only JSONL file, one accepted result per line.
pub struct JsonlResultSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read all entries. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<AcceptedResult>, SinkError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(|e| self.io_err(e))?;
        let mut entries = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AcceptedResult>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

impl ResultSink for JsonlResultSink {
    fn exists(&self, key: &SinkKey) -> Result<bool, SinkError> {
        Ok(self.read_all()?.iter().any(|r| &r.key == key))
    }

    fn accept_result(
        &self,
        key: &SinkKey,
        params: &ParamSet,
        metrics: Option<&PerformanceMetrics>,
    ) -> Result<bool, SinkError> {
        let _guard = self.write_lock.lock().map_err(|_| SinkError::Poisoned)?;
        if self.exists(key)? {
            return Ok(false);
        }

        let json = serde_json::to_string(&accepted(key, params, metrics))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        writeln!(file, "{json}").map_err(|e| self.io_err(e))?;
        file.flush().map_err(|e| self.io_err(e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParamSet {
        [("ema_short".to_string(), 10.0)].into_iter().collect()
    }

    #[test]
    fn memory_sink_rejects_duplicates() {
        let sink = InMemoryResultSink::new();
        let key = SinkKey::new("ma_cross", "BTC", "2024");
        assert!(!sink.exists(&key).unwrap());
        assert!(sink.accept_result(&key, &params(), None).unwrap());
        assert!(sink.exists(&key).unwrap());
        assert!(!sink.accept_result(&key, &params(), None).unwrap());
        assert_eq!(sink.results().len(), 1);
        assert!(!sink.exists(&SinkKey::new("ma_cross", "BTC", "2023")).unwrap());
    }

    #[test]
    fn jsonl_sink_persists_and_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("accepted.jsonl");
        let sink = JsonlResultSink::new(&path);
        let key = SinkKey::new("ma_cross", "ETH", "2024");

        let metrics = PerformanceMetrics {
            sharpe: 1.2,
            trade_count: 7,
            ..PerformanceMetrics::default()
        };
        assert!(sink.accept_result(&key, &params(), Some(&metrics)).unwrap());

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();
        drop(file);

        let reopened = JsonlResultSink::new(&path);
        assert!(reopened.exists(&key).unwrap());
        let all = reopened.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].metrics.as_ref().map(|m| m.trade_count), Some(7));
        assert!(!reopened.accept_result(&key, &params(), None).unwrap());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlResultSink::new(dir.path().join("none.jsonl"));
        assert!(sink.read_all().unwrap().is_empty());
    }
}
