//! Performance metrics for a run: return, win rate, drawdown, Sharpe ratio.

use std::fmt;

use statrs::statistics::Statistics;

/// Summary statistics of a sequence of closed trades and an equity curve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    /// Average loss, as a positive number
    pub avg_loss: f64,
    pub profit_factor: f64,
    /// Fractional change from initial capital to the last equity point
    pub total_return_pct: f64,
    /// Largest peak-to-trough fall of the equity curve, as a fraction of the peak
    pub max_drawdown_pct: f64,
    /// Mean over standard deviation of per-trade returns, not annualized
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
}

/// Calculator for run performance metrics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Build a report from closed-trade P&Ls, per-trade fractional returns and
    /// the equity curve sampled once per bar.
    pub fn calculate(initial_capital: f64, pnls: &[f64], returns: &[f64], equity_curve: &[f64]) -> PerformanceReport {
        let mut report = PerformanceReport {
            total_trades: pnls.len(),
            ..Default::default()
        };

        if let Some(&last) = equity_curve.last() {
            if initial_capital > 0.0 {
                report.total_return_pct = (last - initial_capital) / initial_capital;
            }
        }
        report.max_drawdown_pct = Self::max_drawdown(equity_curve);

        if !pnls.is_empty() {
            Self::calculate_pnl_metrics(&mut report, pnls);
        }
        Self::calculate_sharpe_sortino(&mut report, returns);

        report
    }

    fn calculate_pnl_metrics(report: &mut PerformanceReport, pnls: &[f64]) {
        let (wins, losses): (Vec<f64>, Vec<f64>) = pnls.iter().partition(|&&p| p > 0.0);

        report.winning_trades = wins.len();
        report.losing_trades = losses.len();
        report.total_pnl = pnls.iter().sum();
        report.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            report.avg_win = gross_profit / wins.len() as f64;
        }
        if !losses.is_empty() {
            report.avg_loss = gross_loss / losses.len() as f64;
        }
        if gross_loss > 0.0 {
            report.profit_factor = gross_profit / gross_loss;
        }
    }

    /// 0.0 for curves that never fall below a previous peak.
    pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut max_dd = 0.0f64;

        for &equity in equity_curve {
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak);
            }
        }
        max_dd
    }

    fn calculate_sharpe_sortino(report: &mut PerformanceReport, returns: &[f64]) {
        // Sample standard deviation needs two points
        if returns.len() < 2 {
            return;
        }

        let mean = returns.mean();
        let std_dev = returns.std_dev();
        if std_dev.is_finite() && std_dev > 0.0 {
            report.sharpe_ratio = mean / std_dev;
        }

        let negative: Vec<f64> = returns.iter().filter(|&&r| r < 0.0).copied().collect();
        if negative.len() >= 2 {
            let downside_dev = negative.std_dev();
            if downside_dev.is_finite() && downside_dev > 0.0 {
                report.sortino_ratio = mean / downside_dev;
            }
        }
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:         {}", self.total_trades)?;
        writeln!(f, "Winners:       {} ({:.1}%)", self.winning_trades, self.win_rate * 100.0)?;
        writeln!(f, "Losers:        {}", self.losing_trades)?;
        writeln!(f, "Total P&L:     ${:.2}", self.total_pnl)?;
        writeln!(f, "Avg Win:       ${:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:      ${:.2}", self.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", self.profit_factor)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Return:        {:.2}%", self.total_return_pct * 100.0)?;
        writeln!(f, "Max Drawdown:  {:.2}%", self.max_drawdown_pct * 100.0)?;
        writeln!(f, "Sharpe Ratio:  {:.2}", self.sharpe_ratio)?;
        write!(f, "Sortino Ratio: {:.2}", self.sortino_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_metrics() {
        let pnls = [100.0, -50.0, 200.0, -30.0, 150.0];
        let report = MetricsCalculator::calculate(1000.0, &pnls, &[], &[1000.0, 1370.0]);

        assert_eq!(report.winning_trades, 3);
        assert_eq!(report.losing_trades, 2);
        assert_eq!(report.total_pnl, 370.0);
        assert!((report.win_rate - 0.6).abs() < 1e-9);
        assert!((report.avg_loss - 40.0).abs() < 1e-9);
        assert!((report.profit_factor - 450.0 / 80.0).abs() < 1e-9);
        assert!((report.total_return_pct - 0.37).abs() < 1e-9);
    }

    #[test]
    fn test_max_drawdown() {
        let curve = [100.0, 150.0, 70.0, 50.0, 150.0, 200.0];
        let dd = MetricsCalculator::max_drawdown(&curve);
        assert!((dd - 100.0 / 150.0).abs() < 1e-9);

        assert_eq!(MetricsCalculator::max_drawdown(&[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(MetricsCalculator::max_drawdown(&[]), 0.0);
    }

    #[test]
    fn test_sharpe_ratio() {
        // mean 0.02, sample std dev 0.02
        let returns = [0.0, 0.02, 0.04];
        let report = MetricsCalculator::calculate(1000.0, &[0.0, 20.0, 40.0], &returns, &[]);
        assert!((report.sharpe_ratio - 1.0).abs() < 1e-9);

        // A single trade has no dispersion to measure
        let report = MetricsCalculator::calculate(1000.0, &[10.0], &[0.01], &[]);
        assert_eq!(report.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_empty_run() {
        let report = MetricsCalculator::calculate(1000.0, &[], &[], &[]);
        assert_eq!(report, PerformanceReport::default());
    }
}
