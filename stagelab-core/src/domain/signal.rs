//! Signal series — per-timestamp entry/exit/hold decisions from a signal generator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::candle::SeriesError;

/// One signal value: entry (+1), exit (−1) or hold (0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Entry,
    Exit,
    Hold,
}

impl Signal {
    /// Map the numeric convention (+1 / −1 / 0) to a signal.
    ///
    /// Positive values are entries, negative values exits.
    pub fn from_value(value: i8) -> Self {
        match value.signum() {
            1 => Self::Entry,
            -1 => Self::Exit,
            _ => Self::Hold,
        }
    }

    pub fn value(self) -> i8 {
        match self {
            Self::Entry => 1,
            Self::Exit => -1,
            Self::Hold => 0,
        }
    }
}

/// Time-indexed signal series aligned to a coarse price series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSeries {
    points: Vec<(DateTime<Utc>, Signal)>,
}

impl SignalSeries {
    /// Build a series, rejecting unsorted or duplicate timestamps.
    pub fn new(points: Vec<(DateTime<Utc>, Signal)>) -> Result<Self, SeriesError> {
        for index in 1..points.len() {
            if points[index].0 <= points[index - 1].0 {
                return Err(SeriesError::Unsorted {
                    index,
                    timestamp: points[index].0,
                });
            }
        }
        Ok(Self { points })
    }

    /// Zip timestamps with numeric signal values.
    pub fn from_values(
        timestamps: &[DateTime<Utc>],
        values: &[i8],
    ) -> Result<Self, SeriesError> {
        let points = timestamps
            .iter()
            .zip(values)
            .map(|(&ts, &v)| (ts, Signal::from_value(v)))
            .collect();
        Self::new(points)
    }

    pub fn points(&self) -> &[(DateTime<Utc>, Signal)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn signal_at(&self, index: usize) -> Signal {
        self.points.get(index).map_or(Signal::Hold, |p| p.1)
    }

    pub fn count(&self, signal: Signal) -> usize {
        self.points.iter().filter(|p| p.1 == signal).count()
    }
}
