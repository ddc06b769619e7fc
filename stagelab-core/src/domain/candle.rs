//! Candle and PriceSeries — the market data units fed to the simulator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OHLCV candle at an arbitrary resolution (daily, 15-minute, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Returns true if every price field is finite.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite() && self.high.is_finite() && self.low.is_finite() && self.close.is_finite()
    }

    /// Basic OHLC sanity check: high >= low, high >= open/close, low <= open/close.
    pub fn is_sane(&self) -> bool {
        self.is_finite()
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// Errors raised while building a price or signal series.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SeriesError {
    #[error("timestamps must be strictly increasing: index {index} ({timestamp}) does not follow its predecessor")]
    Unsorted {
        index: usize,
        timestamp: DateTime<Utc>,
    },

    #[error("candle at index {index} has non-finite prices")]
    NonFinite { index: usize },
}

/// A time-ordered candle series.
///
/// Construction validates the time index: timestamps must be strictly
/// increasing and prices finite. Malformed input is rejected, never repaired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Candle>", into = "Vec<Candle>")]
pub struct PriceSeries {
    candles: Vec<Candle>,
}

impl PriceSeries {
    pub fn new(candles: Vec<Candle>) -> Result<Self, SeriesError> {
        for (index, candle) in candles.iter().enumerate() {
            if !candle.is_finite() {
                return Err(SeriesError::NonFinite { index });
            }
            if index > 0 && candle.timestamp <= candles[index - 1].timestamp {
                return Err(SeriesError::Unsorted {
                    index,
                    timestamp: candle.timestamp,
                });
            }
        }
        Ok(Self { candles })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Spacing between the last two candles, used to place end-of-data exits.
    pub fn period(&self) -> Option<Duration> {
        let n = self.candles.len();
        if n < 2 {
            return None;
        }
        Some(self.candles[n - 1].timestamp - self.candles[n - 2].timestamp)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Index of the first candle whose timestamp is `>= ts` (binary search).
    pub fn lower_bound(&self, ts: DateTime<Utc>) -> usize {
        self.candles.partition_point(|c| c.timestamp < ts)
    }
}

impl TryFrom<Vec<Candle>> for PriceSeries {
    type Error = SeriesError;

    fn try_from(candles: Vec<Candle>) -> Result<Self, Self::Error> {
        Self::new(candles)
    }
}

impl From<PriceSeries> for Vec<Candle> {
    fn from(series: PriceSeries) -> Self {
        series.candles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(hour: u32, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn accepts_strictly_increasing_series() {
        let series = PriceSeries::new(vec![candle(0, 100.0), candle(1, 101.0)]).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.period(), Some(Duration::hours(1)));
    }

    #[test]
    fn rejects_unsorted_timestamps() {
        let err = PriceSeries::new(vec![candle(2, 100.0), candle(1, 101.0)]).unwrap_err();
        assert!(matches!(err, SeriesError::Unsorted { index: 1, .. }));
    }

    #[test]
    fn rejects_duplicate_timestamps() {
        let err = PriceSeries::new(vec![candle(1, 100.0), candle(1, 101.0)]).unwrap_err();
        assert!(matches!(err, SeriesError::Unsorted { index: 1, .. }));
    }

    #[test]
    fn rejects_nan_prices() {
        let mut bad = candle(1, 100.0);
        bad.low = f64::NAN;
        let err = PriceSeries::new(vec![candle(0, 100.0), bad]).unwrap_err();
        assert_eq!(err, SeriesError::NonFinite { index: 1 });
    }

    #[test]
    fn lower_bound_finds_first_at_or_after() {
        let series =
            PriceSeries::new(vec![candle(0, 1.0), candle(2, 1.0), candle(4, 1.0)]).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap();
        assert_eq!(series.lower_bound(ts), 1);
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap();
        assert_eq!(series.lower_bound(ts), 2);
    }

    #[test]
    fn deserialization_validates_order() {
        let json = serde_json::to_string(&vec![candle(3, 1.0), candle(1, 1.0)]).unwrap();
        assert!(serde_json::from_str::<PriceSeries>(&json).is_err());
    }

    #[test]
    fn sanity_check() {
        assert!(candle(0, 100.0).is_sane());
        let mut bad = candle(0, 100.0);
        bad.high = 50.0;
        assert!(!bad.is_sane());
    }
}
