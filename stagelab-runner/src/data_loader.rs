//! Candle loading for the runner.
//!
//! Three ways to obtain a price series:
//! 1. CSV files with `timestamp,open,high,low,close[,volume]` rows, the
//!    timestamp either RFC 3339 or epoch milliseconds
//! 2. Deterministic synthetic candles (random walk seeded from the symbol)
//! 3. `resample` of a fine series into fixed-interval coarse buckets
//!
//! `load_target` combines them according to a job's `DataSpec`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use stagelab_core::{Candle, PriceSeries, SeriesError};

use crate::config::DataSpec;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} row {row}: bad timestamp '{value}'")]
    Timestamp {
        path: PathBuf,
        row: usize,
        value: String,
    },
    #[error("{path}: {source}")]
    Series {
        path: PathBuf,
        #[source]
        source: SeriesError,
    },
    #[error("resample interval must be positive")]
    InvalidInterval,
    #[error("series error: {0}")]
    InvalidSeries(#[from] SeriesError),
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Load candles from a CSV file with a header row.
pub fn load_csv(path: &Path) -> Result<PriceSeries, LoadError> {
    let csv_err = |source| LoadError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let mut candles = Vec::new();
    for (row, record) in reader.deserialize::<CsvRow>().enumerate() {
        let record = record.map_err(csv_err)?;
        let timestamp = parse_timestamp(&record.timestamp).ok_or_else(|| LoadError::Timestamp {
            path: path.to_path_buf(),
            row: row + 1,
            value: record.timestamp.clone(),
        })?;
        candles.push(Candle {
            timestamp,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
        });
    }

    PriceSeries::new(candles).map_err(|source| LoadError::Series {
        path: path.to_path_buf(),
        source,
    })
}

/// Generate a deterministic synthetic series for testing/development.
///
/// Random walk from 100.0, seeded from the symbol name so every run sees the
/// same candles.
pub fn synthetic_candles(
    symbol: &str,
    start: DateTime<Utc>,
    interval: Duration,
    count: usize,
) -> PriceSeries {
    let seed: [u8; 32] = *blake3::hash(symbol.as_bytes()).as_bytes();
    let mut rng = StdRng::from_seed(seed);

    let mut candles = Vec::with_capacity(count);
    let mut price = 100.0_f64;
    let mut timestamp = start;
    for _ in 0..count {
        let ret: f64 = rng.gen_range(-0.004..0.004);
        let open = price;
        let close = price * (1.0 + ret);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.002));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.002));
        let volume = rng.gen_range(1_000.0..50_000.0);
        candles.push(Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        });
        price = close;
        timestamp += interval;
    }
    // Strictly increasing by construction.
    PriceSeries::new(candles).unwrap_or_default()
}

/// Aggregate a fine series into coarse candles of `interval`, aligned to the epoch.
///
/// Each bucket takes the first open, max high, min low, last close and summed volume.
pub fn resample(fine: &PriceSeries, interval: Duration) -> Result<PriceSeries, LoadError> {
    let step = interval.num_milliseconds();
    if step <= 0 {
        return Err(LoadError::InvalidInterval);
    }

    let mut coarse: Vec<Candle> = Vec::new();
    let mut current_bucket: Option<i64> = None;
    for candle in fine.candles() {
        let bucket = candle.timestamp.timestamp_millis().div_euclid(step);
        if current_bucket == Some(bucket) {
            if let Some(last) = coarse.last_mut() {
                last.high = last.high.max(candle.high);
                last.low = last.low.min(candle.low);
                last.close = candle.close;
                last.volume += candle.volume;
                continue;
            }
        }
        let timestamp = Utc
            .timestamp_millis_opt(bucket * step)
            .single()
            .unwrap_or(candle.timestamp);
        coarse.push(Candle {
            timestamp,
            ..candle.clone()
        });
        current_bucket = Some(bucket);
    }
    Ok(PriceSeries::new(coarse)?)
}

/// Fine and coarse series for one target.
#[derive(Debug, Clone)]
pub struct TargetData {
    pub fine: PriceSeries,
    pub coarse: PriceSeries,
    pub synthetic: bool,
}

/// Resolve a target's candles from a `DataSpec`.
pub fn load_target(
    spec: &DataSpec,
    target: &str,
    start: DateTime<Utc>,
) -> Result<TargetData, LoadError> {
    let (fine, synthetic) = match spec.fine_path(target) {
        Some(path) => (load_csv(&path)?, false),
        None => {
            let per_day = (24 * 60 / spec.fine_minutes).max(1) as usize;
            (
                synthetic_candles(
                    target,
                    start,
                    Duration::minutes(spec.fine_minutes),
                    spec.synthetic_days * per_day,
                ),
                true,
            )
        }
    };
    let coarse = match spec.coarse_path(target) {
        Some(path) => load_csv(&path)?,
        None => resample(&fine, Duration::minutes(spec.coarse_minutes))?,
    };
    Ok(TargetData {
        fine,
        coarse,
        synthetic,
    })
}
