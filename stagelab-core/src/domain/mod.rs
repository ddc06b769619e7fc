//! Domain types for StageLab

pub mod candle;
pub mod ids;
pub mod signal;
pub mod trade;

pub use candle::{Candle, PriceSeries, SeriesError};
pub use ids::JobId;
pub use signal::{Signal, SignalSeries};
pub use trade::{Direction, ExitReason, Trade};

/// Parameter assignment: name → value.
///
/// `BTreeMap` keeps key order stable for serialization and hashing.
pub type ParamSet = std::collections::BTreeMap<String, f64>;
