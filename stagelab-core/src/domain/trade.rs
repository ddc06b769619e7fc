//! Trade — a completed round-trip position produced by the simulator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Long,
    Short,
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EndOfPeriod,
}

/// A complete round-trip trade: entry → exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub direction: Direction,

    // ── Entry ──
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,

    // ── Exit ──
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,

    /// Net fractional return after fees.
    pub profit: f64,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.profit > 0.0
    }
}

/// Net fractional return of a round trip, fee charged on entry and exit notional.
///
/// - long: `(exit*(1-fee) - entry*(1+fee)) / (entry*(1+fee))`
/// - short: `(entry*(1-fee) - exit*(1+fee)) / (entry*(1-fee))`
pub fn net_profit(direction: Direction, entry_price: f64, exit_price: f64, fee: f64) -> f64 {
    match direction {
        Direction::Long => {
            let cost = entry_price * (1.0 + fee);
            (exit_price * (1.0 - fee) - cost) / cost
        }
        Direction::Short => {
            let proceeds = entry_price * (1.0 - fee);
            (proceeds - exit_price * (1.0 + fee)) / proceeds
        }
    }
}
