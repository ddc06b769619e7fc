//! StageLab Core — domain types, execution simulator, parameter schema and stage plans.
//!
//! This crate contains the pure, synchronous heart of the optimizer:
//! - Domain types (candles, price series, signals, trades, job ids)
//! - Deterministic execution simulator with fine-resolution stop resolution
//! - Declarative parameter schema with correlated groups
//! - Stage generator producing an ordered, fingerprinted stage plan
//! - Moving-average indicators used by the reference signal source

pub mod domain;
pub mod fingerprint;
pub mod indicators;
pub mod schema;
pub mod simulator;
pub mod stages;

pub use domain::{
    Candle, Direction, ExitReason, JobId, ParamSet, PriceSeries, SeriesError, Signal,
    SignalSeries, Trade,
};
pub use fingerprint::PlanFingerprint;
pub use schema::{CorrelatedGroup, ParameterRange, ParameterSchema, SchemaError};
pub use simulator::{simulate, ExecutionSimulator, SimulationConfig, SimulationError};
pub use stages::{build_stages, Stage, StageKind, StageOptions, StagePlan, RISK_PARAMETERS};
