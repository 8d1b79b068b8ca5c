//! Moving-average crossover indicators over a bar series.

use crate::models::PriceBar;

/// Minimum absolute trend (fractional change) that counts as a strong move.
pub const TREND_THRESHOLD: f64 = 0.01;

/// Indicator values at one bar. `None` until the relevant window has filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorRow {
    pub timestamp: i64,
    pub close: f64,
    pub short_ma: Option<f64>,
    pub long_ma: Option<f64>,
    /// Fractional change of close over `short_window` bars
    pub trend: Option<f64>,
    pub ma_diff: Option<f64>,
    /// +1 bullish cross, -1 bearish cross, 0 otherwise
    pub crossover: i8,
}

impl IndicatorRow {
    pub fn is_complete(&self) -> bool {
        self.short_ma.is_some()
            && self.long_ma.is_some()
            && self.trend.is_some()
            && self.ma_diff.is_some()
    }
}

/// Trailing simple average over `window` values.
pub fn simple_moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                return None;
            }
            let sum: f64 = values[i + 1 - window..=i].iter().sum();
            Some(sum / window as f64)
        })
        .collect()
}

/// Fractional change against the value `periods` steps back.
pub fn pct_change(values: &[f64], periods: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if periods == 0 || i < periods {
                return None;
            }
            let base = values[i - periods];
            if base == 0.0 {
                return None;
            }
            Some((values[i] - base) / base)
        })
        .collect()
}

/// Sign flips of the MA spread relative to the previous bar.
///
/// A missing previous value (the first defined index) counts as no crossover.
pub fn crossovers(ma_diff: &[Option<f64>]) -> Vec<i8> {
    (0..ma_diff.len())
        .map(|i| {
            if i == 0 {
                return 0;
            }
            match (ma_diff[i - 1], ma_diff[i]) {
                (Some(prev), Some(cur)) if prev * cur < 0.0 => {
                    if cur > 0.0 {
                        1
                    } else {
                        -1
                    }
                }
                _ => 0,
            }
        })
        .collect()
}

/// Compute the full indicator frame for a bar series.
pub fn calculate(bars: &[PriceBar], short_window: usize, long_window: usize) -> Vec<IndicatorRow> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let short_ma = simple_moving_average(&closes, short_window);
    let long_ma = simple_moving_average(&closes, long_window);
    let trend = pct_change(&closes, short_window);
    let ma_diff: Vec<Option<f64>> = short_ma
        .iter()
        .zip(&long_ma)
        .map(|(s, l)| Some((*s)? - (*l)?))
        .collect();
    let crossover = crossovers(&ma_diff);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| IndicatorRow {
            timestamp: bar.timestamp,
            close: bar.close,
            short_ma: short_ma[i],
            long_ma: long_ma[i],
            trend: trend[i],
            ma_diff: ma_diff[i],
            crossover: crossover[i],
        })
        .collect()
}
