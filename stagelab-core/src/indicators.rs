//! Moving-average indicators over owned close-price buffers.
//!
//! Computed once per candidate over the whole series; warmup positions are NaN.

/// Simple Moving Average. First valid value at index `period - 1`.
///
/// A NaN inside the window makes that output NaN.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let mut sum: f64 = values[..period].iter().sum();
    result[period - 1] = sum / period as f64;

    for i in period..n {
        sum += values[i] - values[i - period];
        if sum.is_nan() {
            // Recompute so a NaN that leaves the window stops poisoning the sum.
            sum = values[(i + 1 - period)..=i].iter().sum();
        }
        result[i] = sum / period as f64;
    }
    result
}

/// Exponential Moving Average.
///
/// `EMA[t] = alpha * x[t] + (1 - alpha) * EMA[t-1]`, `alpha = 2 / (period + 1)`,
/// seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    if seed.is_nan() {
        return result;
    }
    result[period - 1] = seed;

    let mut prev = seed;
    for i in period..n {
        if values[i].is_nan() {
            // NaN taints everything after it.
            break;
        }
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_basic() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_eq!(out[2], 2.0);
        assert_eq!(out[3], 3.0);
        assert_eq!(out[4], 4.0);
    }

    #[test]
    fn sma_short_input_is_all_nan() {
        assert!(sma(&[1.0, 2.0], 3).iter().all(|v| v.is_nan()));
        assert!(sma(&[1.0, 2.0], 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_seeded_with_sma() {
        let out = ema(&[2.0, 4.0, 6.0, 8.0], 3);
        assert_eq!(out[2], 4.0);
        // alpha = 0.5 → 0.5*8 + 0.5*4
        assert!((out[3] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn ema_period_one_tracks_input() {
        let out = ema(&[3.0, 5.0, 7.0], 1);
        assert_eq!(out, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn ema_nan_taints_tail() {
        let out = ema(&[1.0, 1.0, f64::NAN, 1.0], 2);
        assert_eq!(out[1], 1.0);
        assert!(out[2].is_nan() && out[3].is_nan());
    }
}
