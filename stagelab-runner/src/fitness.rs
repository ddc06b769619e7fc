//! Fitness function — the explicit, per-job selection rule for stage winners.

use crate::metrics::PerformanceMetrics;
use serde::{Deserialize, Serialize};

/// Which metric to optimize. Every job names one; there is no implicit default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitnessMetric {
    Sharpe,
    Sortino,
    Calmar,
    TotalReturn,
    WinRate,
    ProfitFactor,
    MaxDrawdown,
    AvgTradeReturn,
}

impl FitnessMetric {
    /// Extract the relevant metric value from a PerformanceMetrics struct.
    pub fn extract(&self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            Self::Sharpe => metrics.sharpe,
            Self::Sortino => metrics.sortino,
            Self::Calmar => metrics.calmar,
            Self::TotalReturn => metrics.total_return,
            Self::WinRate => metrics.win_rate,
            Self::ProfitFactor => metrics.profit_factor,
            Self::MaxDrawdown => metrics.max_drawdown,
            Self::AvgTradeReturn => metrics.avg_trade_return,
        }
    }

    /// Returns true if `a` is better than `b`.
    ///
    /// `a > b` holds for every metric: MaxDrawdown is negative, so -0.05 beats -0.20.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        a > b
    }
}

/// Stage winner selection: maximize `metric`, ties to fewer trades, then first seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionRule {
    pub metric: FitnessMetric,
    /// Candidates with fewer trades are never selected.
    #[serde(default)]
    pub min_trades: usize,
}

impl SelectionRule {
    pub fn new(metric: FitnessMetric, min_trades: usize) -> Self {
        Self { metric, min_trades }
    }

    pub fn score(&self, metrics: &PerformanceMetrics) -> f64 {
        self.metric.extract(metrics)
    }

    /// NaN scores and too-few-trade candidates can never become the best.
    pub fn is_eligible(&self, metrics: &PerformanceMetrics) -> bool {
        !self.score(metrics).is_nan() && metrics.trade_count >= self.min_trades
    }

    /// Whether `challenger` replaces `incumbent` as the stage best.
    ///
    /// Strict: an equal score with an equal trade count keeps the incumbent.
    pub fn beats(
        &self,
        challenger: &PerformanceMetrics,
        incumbent: Option<&PerformanceMetrics>,
    ) -> bool {
        if !self.is_eligible(challenger) {
            return false;
        }
        let Some(incumbent) = incumbent else {
            return true;
        };
        let (a, b) = (self.score(challenger), self.score(incumbent));
        if self.metric.is_better(a, b) {
            return true;
        }
        a == b && challenger.trade_count < incumbent.trade_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(sharpe: f64, trades: usize) -> PerformanceMetrics {
        PerformanceMetrics {
            sharpe,
            trade_count: trades,
            max_drawdown: -0.10,
            ..PerformanceMetrics::default()
        }
    }

    #[test]
    fn extract_sharpe() {
        assert!((FitnessMetric::Sharpe.extract(&metrics(1.5, 3)) - 1.5).abs() < 1e-10);
    }

    #[test]
    fn extract_max_drawdown() {
        let m = metrics(0.0, 1);
        assert!((FitnessMetric::MaxDrawdown.extract(&m) - (-0.10)).abs() < 1e-10);
    }

    #[test]
    fn is_better_max_drawdown() {
        assert!(FitnessMetric::MaxDrawdown.is_better(-0.05, -0.20));
        assert!(!FitnessMetric::MaxDrawdown.is_better(-0.20, -0.05));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let m: FitnessMetric = serde_json::from_str("\"total_return\"").unwrap();
        assert_eq!(m, FitnessMetric::TotalReturn);
        assert_eq!(
            serde_json::to_string(&FitnessMetric::ProfitFactor).unwrap(),
            "\"profit_factor\""
        );
    }

    #[test]
    fn higher_score_wins() {
        let rule = SelectionRule::new(FitnessMetric::Sharpe, 0);
        assert!(rule.beats(&metrics(2.0, 5), Some(&metrics(1.0, 5))));
        assert!(!rule.beats(&metrics(1.0, 5), Some(&metrics(2.0, 5))));
    }

    #[test]
    fn tie_goes_to_fewer_trades_then_first_seen() {
        let rule = SelectionRule::new(FitnessMetric::Sharpe, 0);
        assert!(rule.beats(&metrics(1.0, 3), Some(&metrics(1.0, 5))));
        assert!(!rule.beats(&metrics(1.0, 5), Some(&metrics(1.0, 3))));
        assert!(!rule.beats(&metrics(1.0, 5), Some(&metrics(1.0, 5))));
    }

    #[test]
    fn nan_never_wins() {
        let rule = SelectionRule::new(FitnessMetric::Sharpe, 0);
        assert!(!rule.beats(&metrics(f64::NAN, 5), None));
        assert!(!rule.beats(&metrics(f64::NAN, 5), Some(&metrics(-9.0, 5))));
    }

    #[test]
    fn min_trades_gates_eligibility() {
        let rule = SelectionRule::new(FitnessMetric::Sharpe, 3);
        assert!(!rule.beats(&metrics(5.0, 2), None));
        assert!(rule.beats(&metrics(0.1, 3), None));
    }
}
