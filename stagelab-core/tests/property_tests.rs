//! Property tests for simulator and stage generator invariants.
//!
//! Uses proptest to verify:
//! 1. Determinism: identical inputs always yield identical trade lists
//! 2. No overlap: each trade exits no later than the next one enters
//! 3. Stop priority: a breach before the signal exit always wins
//! 4. Grid size: `floor((max - min) / step) + 1` values per range
//! 5. Correlated groups: one stage whose size is the product of member sizes

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use stagelab_core::{
    build_stages, simulate, Candle, CorrelatedGroup, Direction, ExitReason, ParameterRange,
    ParameterSchema, PriceSeries, SignalSeries, SimulationConfig, StageOptions,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()
}

/// Coarse daily candles and 4-hour fine candles from a random walk of closes.
fn build_series(moves: &[f64]) -> (PriceSeries, PriceSeries) {
    let mut coarse = Vec::new();
    let mut fine = Vec::new();
    let mut price = 100.0;
    for (d, m) in moves.iter().enumerate() {
        let day = t0() + Duration::days(d as i64);
        let open = price;
        let close = (price * (1.0 + m)).max(1.0);
        let mut high = open.max(close);
        let mut low = open.min(close);
        for slot in 0..6 {
            let frac = slot as f64 / 6.0;
            let mid = open + (close - open) * frac;
            let wiggle = mid * m.abs() * 0.5;
            let c = Candle {
                timestamp: day + Duration::hours(4 * slot),
                open: mid,
                high: mid + wiggle,
                low: (mid - wiggle).max(0.5),
                close: mid,
                volume: 1.0,
            };
            high = high.max(c.high);
            low = low.min(c.low);
            fine.push(c);
        }
        coarse.push(Candle {
            timestamp: day,
            open,
            high,
            low,
            close,
            volume: 6.0,
        });
        price = close;
    }
    (
        PriceSeries::new(coarse).unwrap(),
        PriceSeries::new(fine).unwrap(),
    )
}

fn signals_for(coarse: &PriceSeries, values: &[i8]) -> SignalSeries {
    let ts: Vec<_> = coarse.candles().iter().map(|c| c.timestamp).collect();
    SignalSeries::from_values(&ts, values).unwrap()
}

fn arb_market() -> impl Strategy<Value = (Vec<f64>, Vec<i8>)> {
    (5usize..60).prop_flat_map(|n| {
        (
            prop::collection::vec(-0.05..0.05_f64, n),
            prop::collection::vec(prop::sample::select(vec![-1i8, 0, 0, 1]), n),
        )
    })
}

fn arb_config() -> impl Strategy<Value = SimulationConfig> {
    (0.0..0.1_f64, 0.0..0.15_f64, 0.0..0.005_f64, any::<bool>()).prop_map(
        |(sl, tp, fee, short)| SimulationConfig {
            stop_loss_fraction: sl,
            take_profit_fraction: tp,
            fee,
            direction: if short { Direction::Short } else { Direction::Long },
        },
    )
}

proptest! {
    #[test]
    fn simulation_is_deterministic((moves, values) in arb_market(), config in arb_config()) {
        let (coarse, fine) = build_series(&moves);
        let signals = signals_for(&coarse, &values);
        let a = simulate(&signals, &coarse, &fine, &config).unwrap();
        let b = simulate(&signals, &coarse, &fine, &config).unwrap();
        prop_assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn trades_never_overlap((moves, values) in arb_market(), config in arb_config()) {
        let (coarse, fine) = build_series(&moves);
        let signals = signals_for(&coarse, &values);
        let trades = simulate(&signals, &coarse, &fine, &config).unwrap();
        for pair in trades.windows(2) {
            prop_assert!(pair[0].exit_time <= pair[1].entry_time);
        }
        for trade in &trades {
            prop_assert!(trade.entry_time <= trade.exit_time);
        }
    }

    #[test]
    fn stop_breach_before_signal_exit_wins(
        n in 6usize..30,
        entry in 0usize..3,
        breach_offset in 1usize..3,
        stop in 0.01..0.2_f64,
    ) {
        // Flat market with one deep fine dip strictly before the exit signal.
        let moves = vec![0.0; n];
        let (coarse, mut_fine) = build_series(&moves);
        let exit_day = n - 2;
        let breach_day = entry + breach_offset;
        let mut fine: Vec<Candle> = mut_fine.candles().to_vec();
        let dip = fine
            .iter_mut()
            .find(|c| c.timestamp == t0() + Duration::days(breach_day as i64) + Duration::hours(8))
            .unwrap();
        dip.low = 100.0 * (1.0 - stop) - 1.0;
        let fine = PriceSeries::new(fine).unwrap();

        let mut values = vec![0i8; n];
        values[entry] = 1;
        values[exit_day] = -1;
        let signals = signals_for(&coarse, &values);
        let config = SimulationConfig { stop_loss_fraction: stop, ..SimulationConfig::default() };

        let trades = simulate(&signals, &coarse, &fine, &config).unwrap();
        prop_assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        prop_assert!(trades[0].exit_time < coarse.candles()[exit_day + 1].timestamp);
        prop_assert!((trades[0].exit_price - 100.0 * (1.0 - stop)).abs() < 1e-9);
    }

    #[test]
    fn grid_size_matches_step_count(
        min_units in -200i64..200,
        steps in 0usize..300,
        step_units in 1i64..50,
        slack in 0.0..0.99_f64,
    ) {
        // Quarter-unit steps keep min/max exactly representable.
        let step = step_units as f64 * 0.25;
        let min = min_units as f64 * 0.5;
        let max = min + steps as f64 * step + slack * step;
        let range = ParameterRange::new("p", min, max, step);
        prop_assert_eq!(range.count(), steps + 1);
        prop_assert_eq!(range.values().len(), steps + 1);
    }

    #[test]
    fn correlated_group_is_cartesian(a in 1usize..6, b in 1usize..6, extra in 1usize..4) {
        let schema = ParameterSchema::new(vec![
            ParameterRange::new("a", 0.0, (a - 1) as f64, 1.0),
            ParameterRange::new("b", 0.0, (b - 1) as f64, 1.0),
            ParameterRange::new("c", 0.0, (extra - 1) as f64, 1.0),
        ])
        .with_group(CorrelatedGroup::new(["a", "b"]));
        let plan = build_stages(&schema, &StageOptions::default()).unwrap();
        prop_assert_eq!(plan.len(), 2);
        prop_assert_eq!(plan.stages()[0].len(), a * b);
        prop_assert_eq!(plan.total_tests(), a * b + extra);
    }
}

#[test]
fn three_by_four_group_yields_twelve_candidates() {
    let schema = ParameterSchema::new(vec![
        ParameterRange::new("fast", 1.0, 3.0, 1.0),
        ParameterRange::new("slow", 10.0, 40.0, 10.0),
    ])
    .with_group(CorrelatedGroup::new(["fast", "slow"]));
    let plan = build_stages(&schema, &StageOptions::default()).unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.stages()[0].len(), 12);
}
