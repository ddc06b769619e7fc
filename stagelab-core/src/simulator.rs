//! Execution simulator: resolves intrabar ambiguity of coarse signals by
//! replaying fine-resolution candles.
//!
//! Coarse candles (e.g. daily) carry the entry/exit signals; fine candles
//! (e.g. 15-minute) decide what happened in between. Exit priority per trade:
//!
//! 1. stop-loss (first fine candle breaching the stop, filled at the stop price)
//! 2. take-profit (same scan; loses to the stop when one candle breaches both)
//! 3. signal exit (open of the coarse candle after the next exit signal)
//! 4. end of period (last close, one coarse period after the data ends)
//!
//! Pure function of its inputs: no randomness, no wall clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::trade::net_profit;
use crate::domain::{Candle, Direction, ExitReason, PriceSeries, Signal, SignalSeries, Trade};

/// Risk and cost settings for one simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Stop distance as a fraction of entry price. 0 disables stops.
    pub stop_loss_fraction: f64,
    /// Take-profit distance as a fraction of entry price. 0 disables it.
    pub take_profit_fraction: f64,
    /// Fee as a fraction of notional, charged on entry and on exit.
    pub fee: f64,
    pub direction: Direction,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            stop_loss_fraction: 0.0,
            take_profit_fraction: 0.0,
            fee: 0.0,
            direction: Direction::Long,
        }
    }
}

impl SimulationConfig {
    fn validate(&self) -> Result<(), SimulationError> {
        for (field, value) in [
            ("stop_loss_fraction", self.stop_loss_fraction),
            ("take_profit_fraction", self.take_profit_fraction),
            ("fee", self.fee),
        ] {
            if !value.is_finite() || !(0.0..1.0).contains(&value) {
                return Err(SimulationError::InvalidFraction { field, value });
            }
        }
        Ok(())
    }

    fn stop_price(&self, entry_price: f64) -> Option<f64> {
        if self.stop_loss_fraction == 0.0 {
            return None;
        }
        Some(match self.direction {
            Direction::Long => entry_price * (1.0 - self.stop_loss_fraction),
            Direction::Short => entry_price * (1.0 + self.stop_loss_fraction),
        })
    }

    fn target_price(&self, entry_price: f64) -> Option<f64> {
        if self.take_profit_fraction == 0.0 {
            return None;
        }
        Some(match self.direction {
            Direction::Long => entry_price * (1.0 + self.take_profit_fraction),
            Direction::Short => entry_price * (1.0 - self.take_profit_fraction),
        })
    }
}

/// Caller contract violations. The simulator never repairs its input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("signal series has {signals} points but the coarse series has {candles} candles")]
    LengthMismatch { signals: usize, candles: usize },

    #[error("signal {index} is stamped {signal_time} but coarse candle {index} is {candle_time}")]
    Misaligned {
        index: usize,
        signal_time: DateTime<Utc>,
        candle_time: DateTime<Utc>,
    },

    #[error("invalid {field}: {value} (must be finite and within [0, 1))")]
    InvalidFraction { field: &'static str, value: f64 },
}

/// Deterministic trade simulator over a coarse signal series and a fine price path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionSimulator {
    config: SimulationConfig,
}

impl ExecutionSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Produce the ordered, non-overlapping trade list.
    ///
    /// `fine` may be empty, in which case only signal and end-of-period exits occur.
    pub fn simulate(
        &self,
        signals: &SignalSeries,
        coarse: &PriceSeries,
        fine: &PriceSeries,
    ) -> Result<Vec<Trade>, SimulationError> {
        self.config.validate()?;
        check_alignment(signals, coarse)?;

        let candles = coarse.candles();
        let n = candles.len();
        let period = coarse.period().unwrap_or_else(Duration::zero);

        let mut trades = Vec::new();
        let mut last_exit: Option<DateTime<Utc>> = None;

        for i in 0..n {
            if signals.signal_at(i) != Signal::Entry {
                continue;
            }
            let entry = &candles[i];
            if last_exit.is_some_and(|exit| entry.timestamp < exit) {
                continue;
            }

            let planned = planned_exit(signals, candles, i, period);
            let (exit_time, exit_price, exit_reason) = self
                .scan_fine(fine, entry.timestamp, planned.0, entry.open)
                .unwrap_or(planned);

            trades.push(Trade {
                direction: self.config.direction,
                entry_time: entry.timestamp,
                entry_price: entry.open,
                exit_time,
                exit_price,
                exit_reason,
                profit: net_profit(self.config.direction, entry.open, exit_price, self.config.fee),
            });
            last_exit = Some(exit_time);
        }

        Ok(trades)
    }

    /// Scan fine candles in `[from, until)` for the first stop or target breach.
    fn scan_fine(
        &self,
        fine: &PriceSeries,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        entry_price: f64,
    ) -> Option<(DateTime<Utc>, f64, ExitReason)> {
        let stop = self.config.stop_price(entry_price);
        let target = self.config.target_price(entry_price);
        if stop.is_none() && target.is_none() {
            return None;
        }

        let start = fine.lower_bound(from);
        for candle in &fine.candles()[start..] {
            if candle.timestamp >= until {
                break;
            }
            if let Some(stop) = stop {
                if self.stop_breached(candle, stop) {
                    return Some((candle.timestamp, stop, ExitReason::StopLoss));
                }
            }
            if let Some(target) = target {
                if self.target_reached(candle, target) {
                    return Some((candle.timestamp, target, ExitReason::TakeProfit));
                }
            }
        }
        None
    }

    fn stop_breached(&self, candle: &Candle, stop: f64) -> bool {
        match self.config.direction {
            Direction::Long => candle.low <= stop,
            Direction::Short => candle.high >= stop,
        }
    }

    fn target_reached(&self, candle: &Candle, target: f64) -> bool {
        match self.config.direction {
            Direction::Long => candle.high >= target,
            Direction::Short => candle.low <= target,
        }
    }
}

/// Convenience wrapper around [`ExecutionSimulator::simulate`].
pub fn simulate(
    signals: &SignalSeries,
    coarse: &PriceSeries,
    fine: &PriceSeries,
    config: &SimulationConfig,
) -> Result<Vec<Trade>, SimulationError> {
    ExecutionSimulator::new(*config).simulate(signals, coarse, fine)
}

fn check_alignment(signals: &SignalSeries, coarse: &PriceSeries) -> Result<(), SimulationError> {
    if signals.len() != coarse.len() {
        return Err(SimulationError::LengthMismatch {
            signals: signals.len(),
            candles: coarse.len(),
        });
    }
    for (index, ((signal_time, _), candle)) in
        signals.points().iter().zip(coarse.candles()).enumerate()
    {
        if *signal_time != candle.timestamp {
            return Err(SimulationError::Misaligned {
                index,
                signal_time: *signal_time,
                candle_time: candle.timestamp,
            });
        }
    }
    Ok(())
}

/// Exit used when no intrabar trigger fires.
fn planned_exit(
    signals: &SignalSeries,
    candles: &[Candle],
    entry_index: usize,
    period: Duration,
) -> (DateTime<Utc>, f64, ExitReason) {
    let n = candles.len();
    match (entry_index + 1..n).find(|&j| signals.signal_at(j) == Signal::Exit) {
        Some(j) if j + 1 < n => (candles[j + 1].timestamp, candles[j + 1].open, ExitReason::Signal),
        Some(j) => (candles[j].timestamp + period, candles[j].close, ExitReason::Signal),
        None => {
            let last = &candles[n - 1];
            (last.timestamp + period, last.close, ExitReason::EndOfPeriod)
        }
    }
}
