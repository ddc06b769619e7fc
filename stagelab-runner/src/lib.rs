//! StageLab Runner — staged optimizer orchestration on top of `stagelab-core`.
//!
//! This crate provides:
//! - Sequential staged optimizer with lock-in of per-stage winners
//! - Versioned, fingerprinted checkpoints with resume (memory and JSON file stores)
//! - Per-job progress events with late-subscriber state sync
//! - Batch orchestration across targets with skip, pause, cancel and ETA
//! - Performance metrics and fitness selection
//! - Candle loading (CSV, synthetic, resampling) and job configuration

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data_loader;
pub mod events;
pub mod fitness;
pub mod lifecycle;
pub mod metrics;
pub mod optimizer;
pub mod signals;
pub mod sink;

pub use batch::{
    estimate_remaining, spawn_batch, BatchConfig, BatchError, BatchJob, BatchOrchestrator,
    BatchProgress, BatchRegistry, PreparedTarget, TargetError, TargetProvider, TargetStatus,
};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore,
    JsonFileCheckpointStore, ResumeMismatch, StageResult, TrialSummary, CHECKPOINT_VERSION,
};
pub use config::{ConfigError, DataSpec, JobSpec, OptimizerConfig};
pub use data_loader::{load_csv, load_target, resample, synthetic_candles, LoadError, TargetData};
pub use events::{EventBus, JobSnapshot, ProgressEvent, DEFAULT_HISTORY_LIMIT};
pub use fitness::{FitnessMetric, SelectionRule};
pub use lifecycle::{BatchStatus, JobStatus, TransitionError};
pub use metrics::PerformanceMetrics;
pub use optimizer::{
    evaluate, run_jobs_parallel, CandidateError, JobControl, JobOutcome, JobRequest,
    OptimizerError, ParallelJob, ResumeInfo, SequentialOptimizer,
};
pub use signals::{MaCrossSource, SignalError, SignalFrame, SignalSource};
pub use sink::{AcceptedResult, InMemoryResultSink, JsonlResultSink, ResultSink, SinkError, SinkKey};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn performance_metrics_is_send_sync() {
        assert_send::<PerformanceMetrics>();
        assert_sync::<PerformanceMetrics>();
    }

    #[test]
    fn checkpoint_types_are_send_sync() {
        assert_send::<Checkpoint>();
        assert_sync::<Checkpoint>();
        assert_send::<JsonFileCheckpointStore>();
        assert_sync::<JsonFileCheckpointStore>();
        assert_send::<InMemoryCheckpointStore>();
        assert_sync::<InMemoryCheckpointStore>();
    }

    #[test]
    fn optimizer_is_send_sync() {
        assert_send::<SequentialOptimizer>();
        assert_sync::<SequentialOptimizer>();
        assert_send::<JobControl>();
        assert_sync::<JobControl>();
        assert_send::<JobOutcome>();
        assert_sync::<JobOutcome>();
    }

    #[test]
    fn event_bus_is_send_sync() {
        assert_send::<EventBus>();
        assert_sync::<EventBus>();
        assert_send::<ProgressEvent>();
        assert_sync::<ProgressEvent>();
    }

    #[test]
    fn batch_types_are_send_sync() {
        assert_send::<BatchRegistry>();
        assert_sync::<BatchRegistry>();
        assert_send::<BatchOrchestrator>();
        assert_sync::<BatchOrchestrator>();
        assert_send::<BatchProgress>();
        assert_sync::<BatchProgress>();
    }

    #[test]
    fn sinks_are_send_sync() {
        assert_send::<JsonlResultSink>();
        assert_sync::<JsonlResultSink>();
        assert_send::<InMemoryResultSink>();
        assert_sync::<InMemoryResultSink>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<JobSpec>();
        assert_sync::<JobSpec>();
        assert_send::<OptimizerConfig>();
        assert_sync::<OptimizerConfig>();
    }
}
