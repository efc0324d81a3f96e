//! # Rolling Backtest
//!
//! $$
//! V_{t} = \left(V_{t-1} - c\,\lVert \mathbf w_{new}-\mathbf w_{old}\rVert_1 V_{t-1}\,\mathbb 1_{rebal}\right)
//! \left(1 + \mathbf w^\top r_t\right)
//! $$
//!
//! Periodic re-optimization over a trailing price window with turnover-based
//! transaction costs, forward-filled weights between rebalances and explicit
//! recovery when the optimizer fails.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::NaiveDate;
use nalgebra::DVector;
use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::strategy::Optimizer;
use crate::types::PriceHistory;
use crate::types::ReturnSeries;
use crate::types::equal_weights;

/// What to hold when the optimizer fails at a rebalance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
  /// Keep the previously held weights.
  #[default]
  Skip,
  /// Hold `1/n` over the assets available in the window.
  EqualWeight,
}

/// Runtime configuration for [`BacktestSimulator`].
#[derive(Clone, Debug)]
pub struct BacktestConfig {
  /// Price rows handed to the optimizer.
  pub lookback: usize,
  /// Trading days between rebalances.
  pub rebalance_freq: usize,
  pub initial_capital: f64,
  /// Cost as a fraction of traded notional.
  pub transaction_cost: f64,
  /// Assets are kept when their return coverage is strictly above this.
  pub min_coverage: f64,
  pub failure_policy: FailurePolicy,
}

impl Default for BacktestConfig {
  fn default() -> Self {
    Self {
      lookback: 252,
      rebalance_freq: 21,
      initial_capital: 1_000_000.0,
      transaction_cost: 0.001,
      min_coverage: 0.8,
      failure_policy: FailurePolicy::Skip,
    }
  }
}

impl BacktestConfig {
  pub fn validate(&self) -> Result<()> {
    if self.lookback < 2 {
      return Err(PortfolioError::invalid("lookback must be at least 2"));
    }
    if self.rebalance_freq == 0 {
      return Err(PortfolioError::invalid("rebalance_freq must be positive"));
    }
    if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
      return Err(PortfolioError::invalid("initial_capital must be positive"));
    }
    if !(0.0..1.0).contains(&self.transaction_cost) {
      return Err(PortfolioError::invalid("transaction_cost must lie in [0, 1)"));
    }
    if !(0.0..=1.0).contains(&self.min_coverage) {
      return Err(PortfolioError::invalid("min_coverage must lie in [0, 1]"));
    }
    Ok(())
  }
}

/// One simulated trading day.
#[derive(Clone, Debug, PartialEq)]
pub struct BacktestRecord {
  pub date: NaiveDate,
  pub portfolio_value: f64,
  pub daily_return: f64,
  /// Non-zero only on rebalance days.
  pub turnover: f64,
  /// Non-zero only on rebalance days.
  pub transaction_cost: f64,
  /// Held weights, in universe order.
  pub weights: DVector<f64>,
}

/// Why a scheduled rebalance did not change the holdings.
#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
  /// The trailing price window could not be cut from the universe.
  Window(PortfolioError),
  InsufficientAssets { available: usize },
  OptimizerFailed(PortfolioError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RebalanceOutcome {
  Rebalanced,
  /// The optimizer failed and equal weights were bought instead.
  FellBack(PortfolioError),
  Skipped(SkipReason),
}

/// Every attempted rebalance, successful or not.
#[derive(Clone, Debug, PartialEq)]
pub struct RebalanceEvent {
  pub date: NaiveDate,
  pub outcome: RebalanceOutcome,
  pub turnover: f64,
  pub cost: f64,
}

/// Output of one simulation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BacktestResult {
  /// Tradable universe after the coverage filter.
  pub assets: Vec<String>,
  pub records: Vec<BacktestRecord>,
  /// Dates on which holdings were actually replaced.
  pub rebalance_dates: Vec<NaiveDate>,
  pub events: Vec<RebalanceEvent>,
  /// Stopped early through the cancellation flag.
  pub cancelled: bool,
}

impl BacktestResult {
  pub fn final_value(&self) -> Option<f64> {
    self.records.last().map(|r| r.portfolio_value)
  }

  /// `portfolio_value, daily_return, turnover, transaction_cost, weight_<asset>…`
  pub fn column_names(&self) -> Vec<String> {
    ["portfolio_value", "daily_return", "turnover", "transaction_cost"]
      .iter()
      .map(|c| c.to_string())
      .chain(self.assets.iter().map(|a| format!("weight_{a}")))
      .collect()
  }

  /// Rows matching [`Self::column_names`], keyed by date.
  pub fn to_rows(&self) -> Vec<(NaiveDate, Vec<f64>)> {
    self
      .records
      .iter()
      .map(|r| {
        let mut row = vec![r.portfolio_value, r.daily_return, r.turnover, r.transaction_cost];
        row.extend(r.weights.iter());
        (r.date, row)
      })
      .collect()
  }
}

/// Lifecycle of a [`BacktestSimulator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulatorState {
  Idle,
  Preparing,
  Simulating,
  Completed,
}

impl SimulatorState {
  fn label(self) -> &'static str {
    match self {
      Self::Idle => "idle",
      Self::Preparing => "preparing",
      Self::Simulating => "simulating",
      Self::Completed => "completed",
    }
  }
}

/// Universe and returns fixed by [`BacktestSimulator::prepare`].
#[derive(Clone, Debug)]
struct Prepared {
  universe: PriceHistory,
  returns: ReturnSeries,
  /// Price row of each return date.
  price_rows: Vec<usize>,
}

/// Single-use rolling rebalancing simulator.
#[derive(Clone, Debug)]
pub struct BacktestSimulator {
  config: BacktestConfig,
  prices: PriceHistory,
  state: SimulatorState,
  prepared: Option<Prepared>,
}

impl BacktestSimulator {
  pub fn new(prices: PriceHistory, config: BacktestConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      config,
      prices,
      state: SimulatorState::Idle,
      prepared: None,
    })
  }

  pub fn config(&self) -> &BacktestConfig {
    &self.config
  }

  pub fn state(&self) -> SimulatorState {
    self.state
  }

  /// Working return series, available once prepared.
  pub fn returns(&self) -> Option<&ReturnSeries> {
    self.prepared.as_ref().map(|p| &p.returns)
  }

  /// Tradable assets, available once prepared.
  pub fn universe(&self) -> Option<&[String]> {
    self.prepared.as_ref().map(|p| p.universe.assets())
  }

  /// Compute returns and drop assets whose coverage is not above `min_coverage`.
  pub fn prepare(&mut self) -> Result<&ReturnSeries> {
    if self.state != SimulatorState::Idle {
      return Err(PortfolioError::InvalidState {
        expected: SimulatorState::Idle.label(),
        found: self.state.label(),
      });
    }
    self.state = SimulatorState::Preparing;

    let all = self.prices.returns();
    let coverage = all.coverage();
    let keep: Vec<usize> = (0..all.n_assets())
      .filter(|&j| coverage[j] > self.config.min_coverage)
      .collect();
    for j in (0..all.n_assets()).filter(|j| !keep.contains(j)) {
      debug!(asset = %all.assets()[j], coverage = coverage[j], "asset dropped by coverage filter");
    }

    let returns = all.select_indices(&keep);
    let universe = self.prices.select_indices(&keep);
    let price_rows = returns
      .dates()
      .iter()
      .map(|d| {
        universe
          .dates()
          .binary_search(d)
          .map_err(|_| PortfolioError::invalid(format!("return date {d} has no price row")))
      })
      .collect::<Result<Vec<_>>>()?;

    let prepared = self.prepared.insert(Prepared {
      universe,
      returns,
      price_rows,
    });
    Ok(&prepared.returns)
  }

  pub fn run<O: Optimizer + ?Sized>(&mut self, optimizer: &O) -> Result<BacktestResult> {
    self.run_with_cancel(optimizer, &AtomicBool::new(false))
  }

  /// Like [`Self::run`], checking `cancel` before every rebalance.
  pub fn run_with_cancel<O: Optimizer + ?Sized>(
    &mut self,
    optimizer: &O,
    cancel: &AtomicBool,
  ) -> Result<BacktestResult> {
    match self.state {
      SimulatorState::Idle => {
        self.prepare()?;
      }
      SimulatorState::Preparing => {}
      other => {
        return Err(PortfolioError::InvalidState {
          expected: SimulatorState::Preparing.label(),
          found: other.label(),
        })
      }
    }

    let available = self.prepared.as_ref().map_or(0, |p| p.returns.len());
    if available <= self.config.lookback {
      return Err(PortfolioError::invalid(format!(
        "{available} return observations do not exceed lookback {}",
        self.config.lookback
      )));
    }
    let prepared = self.prepared.take().ok_or(PortfolioError::InvalidState {
      expected: SimulatorState::Preparing.label(),
      found: self.state.label(),
    })?;

    self.state = SimulatorState::Simulating;
    let result = self.simulate(&prepared, optimizer, cancel);
    self.prepared = Some(prepared);
    self.state = SimulatorState::Completed;
    Ok(result)
  }

  fn simulate<O: Optimizer + ?Sized>(
    &self,
    prepared: &Prepared,
    optimizer: &O,
    cancel: &AtomicBool,
  ) -> BacktestResult {
    let cfg = &self.config;
    let returns = &prepared.returns;
    let n = returns.n_assets();
    let dates = returns.dates();

    info!(
      strategy = optimizer.name(),
      assets = n,
      start = %dates[cfg.lookback],
      end = %dates[dates.len() - 1],
      "starting backtest"
    );

    let mut value = cfg.initial_capital;
    let mut held = DVector::zeros(n);
    let mut result = BacktestResult {
      assets: returns.assets().to_vec(),
      ..BacktestResult::default()
    };

    for t in (cfg.lookback..returns.len()).step_by(cfg.rebalance_freq) {
      if cancel.load(Ordering::Relaxed) {
        info!(date = %dates[t], "backtest cancelled");
        result.cancelled = true;
        break;
      }

      let (outcome, target) = self.rebalance(prepared, t, optimizer);
      let (turnover, cost) = match target {
        Some(w) => {
          let turnover = (&w - &held).abs().sum();
          let cost = turnover * cfg.transaction_cost * value;
          value -= cost;
          held = w;
          result.rebalance_dates.push(dates[t]);
          debug!(date = %dates[t], turnover, cost, "rebalanced");
          (turnover, cost)
        }
        None => (0.0, 0.0),
      };
      result.events.push(RebalanceEvent {
        date: dates[t],
        outcome,
        turnover,
        cost,
      });

      for day in t..(t + cfg.rebalance_freq).min(returns.len()) {
        let daily_return = match accrue(&held, returns, day, value) {
          Ok(r) => r,
          Err(err) => {
            warn!(date = %dates[day], %err, "recording zero return");
            0.0
          }
        };
        value *= 1.0 + daily_return;

        let first = day == t;
        result.records.push(BacktestRecord {
          date: dates[day],
          portfolio_value: value,
          daily_return,
          turnover: if first { turnover } else { 0.0 },
          transaction_cost: if first { cost } else { 0.0 },
          weights: held.clone(),
        });
      }
    }

    info!(
      rebalances = result.rebalance_dates.len(),
      attempts = result.events.len(),
      final_value = value,
      "backtest completed"
    );
    result
  }

  /// Outcome of the rebalance at return row `t` and the new universe weights, if any.
  fn rebalance<O: Optimizer + ?Sized>(
    &self,
    prepared: &Prepared,
    t: usize,
    optimizer: &O,
  ) -> (RebalanceOutcome, Option<DVector<f64>>) {
    let date = prepared.returns.dates()[t];
    let end = prepared.price_rows[t];
    let start = end.saturating_sub(self.config.lookback);
    let window = match prepared.universe.rows(start, end) {
      Ok(w) => w.complete_assets(),
      Err(err) => {
        warn!(%date, %err, "skipping rebalance: no price window");
        return (RebalanceOutcome::Skipped(SkipReason::Window(err)), None);
      }
    };

    if window.n_assets() < 2 {
      warn!(%date, available = window.n_assets(), "skipping rebalance: insufficient assets");
      return (
        RebalanceOutcome::Skipped(SkipReason::InsufficientAssets {
          available: window.n_assets(),
        }),
        None,
      );
    }

    // window assets are a subset of the universe, in universe order
    let columns: Vec<usize> = window
      .assets()
      .iter()
      .filter_map(|a| prepared.universe.asset_index(a))
      .collect();
    let n = prepared.universe.n_assets();

    match optimizer
      .optimize(&window)
      .and_then(|raw| reindex(&raw, &columns, n))
    {
      Ok(w) => (RebalanceOutcome::Rebalanced, Some(w)),
      Err(err) => match self.config.failure_policy {
        FailurePolicy::Skip => {
          warn!(%date, %err, "optimizer failed, keeping previous weights");
          (
            RebalanceOutcome::Skipped(SkipReason::OptimizerFailed(err)),
            None,
          )
        }
        FailurePolicy::EqualWeight => {
          warn!(%date, %err, "optimizer failed, falling back to equal weights");
          let eq = equal_weights(columns.len());
          let mut w = DVector::zeros(n);
          for (k, &j) in columns.iter().enumerate() {
            w[j] = eq[k];
          }
          (RebalanceOutcome::FellBack(err), Some(w))
        }
      },
    }
  }
}

/// Place window weights onto the universe and rescale to unit sum.
fn reindex(raw: &DVector<f64>, columns: &[usize], n: usize) -> Result<DVector<f64>> {
  if raw.len() != columns.len() {
    return Err(PortfolioError::dimension(
      "optimizer weights vs window assets",
      columns.len(),
      raw.len(),
    ));
  }
  if raw.iter().any(|w| !w.is_finite()) {
    return Err(PortfolioError::invalid("optimizer returned non-finite weights"));
  }

  let mut w = DVector::zeros(n);
  for (k, &j) in columns.iter().enumerate() {
    w[j] = raw[k];
  }
  let total = w.sum();
  if total <= 0.0 {
    return Err(PortfolioError::invalid(format!(
      "optimizer weights sum to {total}"
    )));
  }
  Ok(w / total)
}

/// Portfolio return of day `t`; missing asset returns count as zero.
fn accrue(held: &DVector<f64>, returns: &ReturnSeries, t: usize, value: f64) -> Result<f64> {
  let row = returns.values().row(t);
  let r: f64 = held
    .iter()
    .zip(row.iter())
    .map(|(w, r)| if r.is_nan() { 0.0 } else { w * r })
    .sum();

  if !r.is_finite() || !(value * (1.0 + r)).is_finite() {
    return Err(PortfolioError::Accounting(format!(
      "non-finite return {r} on {}",
      returns.dates()[t]
    )));
  }
  Ok(r)
}

/// One independent simulation of a batch.
pub struct BacktestJob {
  pub name: String,
  pub config: BacktestConfig,
  pub optimizer: Box<dyn Optimizer>,
}

impl BacktestJob {
  pub fn new(name: impl Into<String>, config: BacktestConfig, optimizer: Box<dyn Optimizer>) -> Self {
    Self {
      name: name.into(),
      config,
      optimizer,
    }
  }
}

/// Run independent backtests in parallel, each over its own copy of `prices`.
pub fn run_batch(prices: &PriceHistory, jobs: &[BacktestJob]) -> Vec<(String, Result<BacktestResult>)> {
  jobs
    .par_iter()
    .map(|job| {
      let result = BacktestSimulator::new(prices.clone(), job.config.clone())
        .and_then(|mut sim| sim.run(job.optimizer.as_ref()));
      if let Err(err) = &result {
        warn!(job = %job.name, %err, "backtest job failed");
      }
      (job.name.clone(), result)
    })
    .collect()
}
