//! Scenario tests for the execution simulator.
//!
//! Coarse candles are daily; fine candles are 15-minute slices of each day.

use chrono::{DateTime, Duration, TimeZone, Utc};
use stagelab_core::{
    simulate, Candle, Direction, ExitReason, PriceSeries, SignalSeries, SimulationConfig,
};

fn t(day: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(day)
}

/// Eight daily candles opening at 100, 101, ... with a tight range.
fn coarse() -> PriceSeries {
    PriceSeries::new(
        (0..8)
            .map(|d| Candle {
                timestamp: t(d),
                open: 100.0 + d as f64,
                high: 100.8 + d as f64,
                low: 99.6 + d as f64,
                close: 100.4 + d as f64,
                volume: 10.0,
            })
            .collect(),
    )
    .unwrap()
}

/// 15-minute candles for every day; `low_override` replaces one slot's low.
fn fine(low_override: Option<(i64, i64, f64)>) -> PriceSeries {
    let mut candles = Vec::new();
    for d in 0..8 {
        for slot in 0..96 {
            let base = 100.0 + d as f64;
            let mut low = base - 0.3;
            if let Some((od, os, ol)) = low_override {
                if od == d && os == slot {
                    low = ol;
                }
            }
            candles.push(Candle {
                timestamp: t(d) + Duration::minutes(15 * slot),
                open: base,
                high: base + 0.5,
                low,
                close: base + 0.2,
                volume: 1.0,
            });
        }
    }
    PriceSeries::new(candles).unwrap()
}

fn entry_t0_exit_t5() -> SignalSeries {
    let ts: Vec<_> = (0..8).map(t).collect();
    SignalSeries::from_values(&ts, &[1, 0, 0, 0, 0, -1, 0, 0]).unwrap()
}

fn stop_2pct() -> SimulationConfig {
    SimulationConfig {
        stop_loss_fraction: 0.02,
        ..SimulationConfig::default()
    }
}

#[test]
fn scenario_stop_loss_hit_on_fine_data() {
    // GIVEN entry at t0 (open 100) with a 2% stop → stop price 98
    // AND a fine candle on day 2 whose low is 97
    let fine = fine(Some((2, 10, 97.0)));

    // WHEN the trade is simulated
    let trades = simulate(&entry_t0_exit_t5(), &coarse(), &fine, &stop_2pct()).unwrap();

    // THEN the stop fires at that fine candle, filled exactly at 98
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.entry_price, 100.0);
    assert_eq!(trade.exit_time, t(2) + Duration::minutes(150));
    assert!((trade.exit_price - 98.0).abs() < 1e-12);
    assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    assert!(trade.exit_time < t(6));
}

#[test]
fn scenario_no_breach_exits_on_signal() {
    // GIVEN the same setup but fine lows never reach 98
    let trades = simulate(&entry_t0_exit_t5(), &coarse(), &fine(None), &stop_2pct()).unwrap();

    // THEN the trade exits at the open of the candle after the exit signal
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_time, t(6));
    assert_eq!(trades[0].exit_price, 106.0);
    assert_eq!(trades[0].exit_reason, ExitReason::Signal);
}

#[test]
fn stop_after_signal_exit_is_ignored() {
    // A breach on day 6 lies after the signal exit (t6 open) and must not count.
    let trades = simulate(
        &entry_t0_exit_t5(),
        &coarse(),
        &fine(Some((6, 4, 50.0))),
        &stop_2pct(),
    )
    .unwrap();
    assert_eq!(trades[0].exit_reason, ExitReason::Signal);
}

#[test]
fn empty_fine_series_skips_stop_checks() {
    let trades = simulate(
        &entry_t0_exit_t5(),
        &coarse(),
        &PriceSeries::empty(),
        &stop_2pct(),
    )
    .unwrap();
    assert_eq!(trades[0].exit_reason, ExitReason::Signal);
}

#[test]
fn entry_before_stop_exit_is_ignored_then_later_entry_taken() {
    // Entry t0, stop on day 1, entry signals on t1 (before the stop fill) and t3.
    let ts: Vec<_> = (0..8).map(t).collect();
    let signals = SignalSeries::from_values(&ts, &[1, 1, 0, 1, 0, -1, 0, 0]).unwrap();
    let fine = fine(Some((1, 40, 90.0)));

    let trades = simulate(&signals, &coarse(), &fine, &stop_2pct()).unwrap();

    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
    assert_eq!(trades[0].exit_time, t(1) + Duration::minutes(600));
    assert_eq!(trades[1].entry_time, t(3));
    assert_eq!(trades[1].exit_reason, ExitReason::Signal);
    assert!(trades[0].exit_time <= trades[1].entry_time);
}

#[test]
fn short_trade_profit_uses_short_formula() {
    let config = SimulationConfig {
        fee: 0.001,
        direction: Direction::Short,
        ..SimulationConfig::default()
    };
    let trades = simulate(&entry_t0_exit_t5(), &coarse(), &fine(None), &config).unwrap();
    let trade = &trades[0];
    let expected = (100.0 * 0.999 - 106.0 * 1.001) / (100.0 * 0.999);
    assert!((trade.profit - expected).abs() < 1e-12);
    assert_eq!(trade.direction, Direction::Short);
}

#[test]
fn end_of_period_when_no_exit_signal() {
    let ts: Vec<_> = (0..8).map(t).collect();
    let signals = SignalSeries::from_values(&ts, &[0, 0, 0, 1, 0, 0, 0, 0]).unwrap();
    let trades = simulate(&signals, &coarse(), &fine(None), &stop_2pct()).unwrap();
    assert_eq!(trades[0].exit_reason, ExitReason::EndOfPeriod);
    assert_eq!(trades[0].exit_time, t(8));
    assert!((trades[0].exit_price - (100.4 + 7.0)).abs() < 1e-12);
}

#[test]
fn identical_inputs_identical_trades() {
    let fine = fine(Some((3, 7, 97.0)));
    let a = simulate(&entry_t0_exit_t5(), &coarse(), &fine, &stop_2pct()).unwrap();
    let b = simulate(&entry_t0_exit_t5(), &coarse(), &fine, &stop_2pct()).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}
