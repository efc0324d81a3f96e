//! # Performance Summary
//!
//! $$
//! \text{CAGR} = \left(\frac{V_T}{V_0}\right)^{D/T} - 1,\qquad
//! \text{MDD} = \max_t \left(1 - \frac{V_t}{\max_{s\le t} V_s}\right)
//! $$
//!
//! Headline statistics of a finished backtest.

use std::fmt;

use crate::backtest::BacktestResult;
use crate::backtest::RebalanceOutcome;
use crate::error::PortfolioError;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq)]
pub struct PerformanceSummary {
  /// `V_T / V_0 - 1`, net of transaction costs.
  pub total_return: f64,
  pub cagr: f64,
  /// Annualized sample standard deviation of daily returns.
  pub volatility: f64,
  /// Annualized `(mean - r_f/D) / std`.
  pub sharpe: f64,
  /// Largest peak-to-trough loss as a positive fraction.
  pub max_drawdown: f64,
  pub total_turnover: f64,
  pub total_cost: f64,
  pub rebalances: usize,
  /// Rebalances that fell back to equal weights.
  pub fallbacks: usize,
  pub skipped: usize,
  pub num_days: usize,
}

impl PerformanceSummary {
  /// Summarize `result` for a run started with `initial_capital`.
  ///
  /// `risk_free` is annual; daily returns are annualized with `periods_per_year`.
  pub fn from_backtest(
    result: &BacktestResult,
    initial_capital: f64,
    periods_per_year: f64,
    risk_free: f64,
  ) -> Result<Self> {
    if result.records.is_empty() {
      return Err(PortfolioError::invalid("backtest produced no records"));
    }
    if !(initial_capital > 0.0 && periods_per_year > 0.0) {
      return Err(PortfolioError::invalid(
        "initial capital and periods per year must be positive",
      ));
    }

    let returns: Vec<f64> = result.records.iter().map(|r| r.daily_return).collect();
    let n = returns.len();
    let final_value = result.records[n - 1].portfolio_value;
    let total_return = final_value / initial_capital - 1.0;

    let years = n as f64 / periods_per_year;
    let cagr = if total_return > -1.0 {
      (1.0 + total_return).powf(1.0 / years) - 1.0
    } else {
      -1.0
    };

    let mean = returns.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
      returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
      0.0
    };
    let std = variance.sqrt();
    let volatility = std * periods_per_year.sqrt();
    let sharpe = if std > 0.0 {
      (mean - risk_free / periods_per_year) / std * periods_per_year.sqrt()
    } else {
      0.0
    };

    let mut peak = initial_capital;
    let mut max_drawdown: f64 = 0.0;
    for r in &result.records {
      peak = peak.max(r.portfolio_value);
      max_drawdown = max_drawdown.max(1.0 - r.portfolio_value / peak);
    }

    let fallbacks = result
      .events
      .iter()
      .filter(|e| matches!(e.outcome, RebalanceOutcome::FellBack(_)))
      .count();
    let skipped = result
      .events
      .iter()
      .filter(|e| matches!(e.outcome, RebalanceOutcome::Skipped(_)))
      .count();

    Ok(Self {
      total_return,
      cagr,
      volatility,
      sharpe,
      max_drawdown,
      total_turnover: result.records.iter().map(|r| r.turnover).sum(),
      total_cost: result.records.iter().map(|r| r.transaction_cost).sum(),
      rebalances: result.rebalance_dates.len(),
      fallbacks,
      skipped,
      num_days: n,
    })
  }
}

impl fmt::Display for PerformanceSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Total return:   {:>8.2}%", self.total_return * 100.0)?;
    writeln!(f, "CAGR:           {:>8.2}%", self.cagr * 100.0)?;
    writeln!(f, "Volatility:     {:>8.2}%", self.volatility * 100.0)?;
    writeln!(f, "Sharpe:         {:>8.2}", self.sharpe)?;
    writeln!(f, "Max drawdown:   {:>8.2}%", self.max_drawdown * 100.0)?;
    writeln!(f, "Turnover:       {:>8.2}", self.total_turnover)?;
    writeln!(f, "Costs:          {:>8.2}", self.total_cost)?;
    write!(
      f,
      "Rebalances:     {} ({} fallback, {} skipped) over {} days",
      self.rebalances, self.fallbacks, self.skipped, self.num_days
    )
  }
}
