//! Performance metrics — pure functions over a simulated trade list.
//!
//! Every metric is computed from per-trade net returns (`Trade::profit`).
//! The equity curve compounds those returns from 1.0; nothing is annualized,
//! since a trade list carries no notion of calendar exposure.

use serde::{Deserialize, Serialize};
use stagelab_core::Trade;

/// Aggregate performance metrics for one candidate evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_trade_return: f64,
    pub trade_count: usize,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
}

impl PerformanceMetrics {
    /// Compute all metrics from a trade list.
    pub fn compute(trades: &[Trade]) -> Self {
        let returns: Vec<f64> = trades.iter().map(|t| t.profit).collect();
        let curve = equity_curve(&returns);
        Self {
            total_return: total_return(&curve),
            sharpe: sharpe_ratio(&returns),
            sortino: sortino_ratio(&returns),
            calmar: calmar_ratio(&curve),
            max_drawdown: max_drawdown(&curve),
            win_rate: win_rate(trades),
            profit_factor: profit_factor(&returns),
            avg_trade_return: mean_f64(&returns),
            trade_count: trades.len(),
            max_consecutive_wins: max_consecutive(trades, true),
            max_consecutive_losses: max_consecutive(trades, false),
        }
    }
}

// ─── Individual metric functions ────────────────────────────────────

/// Compounded equity starting at 1.0, one point per closed trade.
pub fn equity_curve(returns: &[f64]) -> Vec<f64> {
    let mut curve = Vec::with_capacity(returns.len() + 1);
    let mut equity = 1.0;
    curve.push(equity);
    for r in returns {
        equity *= 1.0 + r;
        curve.push(equity);
    }
    curve
}

/// Total return as a fraction: (final - initial) / initial.
pub fn total_return(curve: &[f64]) -> f64 {
    match (curve.first(), curve.last()) {
        (Some(&initial), Some(&last)) if curve.len() >= 2 && initial > 0.0 => {
            (last - initial) / initial
        }
        _ => 0.0,
    }
}

/// Per-trade Sharpe ratio: mean / sample std of trade returns.
///
/// Returns 0.0 with fewer than 2 trades or zero variance.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(returns) / std
}

/// Per-trade Sortino ratio (downside deviation only).
pub fn sortino_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let downside_sq: f64 = returns.iter().filter(|&&r| r < 0.0).map(|r| r * r).sum();
    if downside_sq == 0.0 {
        return 0.0;
    }
    let downside_std = (downside_sq / returns.len() as f64).sqrt();
    if downside_std < 1e-15 {
        return 0.0;
    }
    mean_f64(returns) / downside_std
}

/// Total return over |max drawdown|. 0.0 without a drawdown or a gain.
pub fn calmar_ratio(curve: &[f64]) -> f64 {
    let ret = total_return(curve);
    let dd = max_drawdown(curve);
    if dd >= 0.0 || ret <= 0.0 {
        return 0.0;
    }
    ret / dd.abs()
}

/// Maximum drawdown as a negative fraction (e.g., -0.15 = 15% drawdown).
pub fn max_drawdown(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for &eq in curve {
        peak = peak.max(eq);
        if peak > 0.0 {
            max_dd = max_dd.min((eq - peak) / peak);
        }
    }
    max_dd
}

/// Fraction of trades with a positive net return.
pub fn win_rate(trades: &[Trade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().filter(|t| t.is_winner()).count() as f64 / trades.len() as f64
}

/// Gross gains / gross losses over trade returns.
///
/// Capped at 100.0 for edge cases (all winners, zero losses).
pub fn profit_factor(returns: &[f64]) -> f64 {
    let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    if gross_loss < 1e-10 {
        return if gross_profit > 0.0 { 100.0 } else { 0.0 };
    }
    (gross_profit / gross_loss).min(100.0)
}

// ─── Helpers ────────────────────────────────────────────────────────

pub(crate) fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn max_consecutive(trades: &[Trade], winners: bool) -> usize {
    let mut max_streak = 0;
    let mut current = 0;
    for trade in trades {
        if trade.is_winner() == winners {
            current += 1;
            max_streak = max_streak.max(current);
        } else {
            current = 0;
        }
    }
    max_streak
}
