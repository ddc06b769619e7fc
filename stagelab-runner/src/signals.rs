//! Signal sources — the external collaborator that turns parameters into signals.
//!
//! The optimizer only sees the `SignalSource` trait. `MaCrossSource` is the
//! reference implementation: an EMA crossover over a fixed coarse series, with
//! closes extracted once into an owned buffer.

use std::sync::Arc;
use thiserror::Error;

use stagelab_core::indicators::ema;
use stagelab_core::{ParamSet, PriceSeries, Signal, SignalSeries};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("missing parameter '{0}'")]
    MissingParameter(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("signal generation failed: {0}")]
    Failed(String),
}

/// Coarse candles plus the signals computed against them.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub coarse: Arc<PriceSeries>,
    pub signals: SignalSeries,
}

/// Anything that can produce a signal series for a parameter assignment.
pub trait SignalSource: Send + Sync {
    fn generate_signals(&self, params: &ParamSet) -> Result<SignalFrame, SignalError>;
}

/// EMA crossover: entry when the short EMA crosses above the long one,
/// exit when it crosses back below.
pub struct MaCrossSource {
    coarse: Arc<PriceSeries>,
    closes: Vec<f64>,
    short_param: String,
    long_param: String,
}

impl MaCrossSource {
    pub fn new(coarse: Arc<PriceSeries>) -> Self {
        Self::with_params(coarse, "ema_short", "ema_long")
    }

    pub fn with_params(
        coarse: Arc<PriceSeries>,
        short_param: impl Into<String>,
        long_param: impl Into<String>,
    ) -> Self {
        let closes = coarse.closes();
        Self {
            coarse,
            closes,
            short_param: short_param.into(),
            long_param: long_param.into(),
        }
    }

    fn period(&self, params: &ParamSet, name: &str) -> Result<usize, SignalError> {
        let value = *params
            .get(name)
            .ok_or_else(|| SignalError::MissingParameter(name.to_string()))?;
        if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
            return Err(SignalError::InvalidParameter {
                name: name.to_string(),
                reason: format!("period must be a positive integer, got {value}"),
            });
        }
        Ok(value as usize)
    }
}

impl SignalSource for MaCrossSource {
    fn generate_signals(&self, params: &ParamSet) -> Result<SignalFrame, SignalError> {
        let short = self.period(params, &self.short_param)?;
        let long = self.period(params, &self.long_param)?;
        if short >= long {
            return Err(SignalError::InvalidParameter {
                name: self.short_param.clone(),
                reason: format!("short period {short} must be below long period {long}"),
            });
        }

        let fast = ema(&self.closes, short);
        let slow = ema(&self.closes, long);
        let mut points = Vec::with_capacity(self.closes.len());
        for (i, candle) in self.coarse.candles().iter().enumerate() {
            let signal = if i == 0 || [fast[i], slow[i], fast[i - 1], slow[i - 1]]
                .iter()
                .any(|v| v.is_nan())
            {
                Signal::Hold
            } else if fast[i - 1] <= slow[i - 1] && fast[i] > slow[i] {
                Signal::Entry
            } else if fast[i - 1] >= slow[i - 1] && fast[i] < slow[i] {
                Signal::Exit
            } else {
                Signal::Hold
            };
            points.push((candle.timestamp, signal));
        }

        let signals =
            SignalSeries::new(points).map_err(|e| SignalError::Failed(e.to_string()))?;
        Ok(SignalFrame {
            coarse: Arc::clone(&self.coarse),
            signals,
        })
    }
}
