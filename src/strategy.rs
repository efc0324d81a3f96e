//! # Strategies
//!
//! $$
//! \text{window} \mapsto \mathbf w,\qquad \mathbf 1^\top\mathbf w = 1
//! $$
//!
//! The "price window in, weight vector out" contract consumed by the backtest,
//! and its mean-variance, max-Sharpe and Black-Litterman implementations.

use std::collections::HashMap;

use chrono::NaiveDate;
use nalgebra::DVector;
use tracing::debug;

use crate::black_litterman::BlackLittermanEngine;
use crate::black_litterman::View;
use crate::black_litterman::ViewSpecification;
use crate::black_litterman::equilibrium_prior;
use crate::black_litterman::implied_risk_aversion;
use crate::black_litterman::market_weights;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::mean_variance::MeanVarianceOptimizer;
use crate::stats::StatisticsEstimator;
use crate::types::PriceHistory;
use crate::types::equal_weights;

/// Weight producer for one price window.
///
/// The returned vector is in `window.assets()` order. Windows handed over by the
/// backtest never contain missing prices.
pub trait Optimizer: Send + Sync {
  fn name(&self) -> &str {
    "custom"
  }

  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>>;
}

impl<F> Optimizer for F
where
  F: Fn(&PriceHistory) -> Result<DVector<f64>> + Send + Sync,
{
  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>> {
    self(window)
  }
}

/// `1/n` over the window.
#[derive(Clone, Copy, Debug, Default)]
pub struct EqualWeight;

impl Optimizer for EqualWeight {
  fn name(&self) -> &str {
    "equal-weight"
  }

  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>> {
    if window.n_assets() == 0 {
      return Err(PortfolioError::invalid("window has no assets"));
    }
    Ok(equal_weights(window.n_assets()))
  }
}

/// Global minimum-variance portfolio.
#[derive(Clone, Debug, Default)]
pub struct MinimumVariance {
  pub optimizer: MeanVarianceOptimizer,
}

impl Optimizer for MinimumVariance {
  fn name(&self) -> &str {
    "minimum-variance"
  }

  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>> {
    Ok(self.optimizer.minimum_variance(window)?.weights)
  }
}

/// Minimum variance at a fixed annualized target return.
#[derive(Clone, Debug)]
pub struct TargetReturn {
  pub optimizer: MeanVarianceOptimizer,
  pub target: f64,
}

impl TargetReturn {
  pub fn new(target: f64) -> Self {
    Self {
      optimizer: MeanVarianceOptimizer::default(),
      target,
    }
  }
}

impl Optimizer for TargetReturn {
  fn name(&self) -> &str {
    "target-return"
  }

  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>> {
    Ok(
      self
        .optimizer
        .minimum_variance_for_target(window, self.target)?
        .weights,
    )
  }
}

/// Maximum Sharpe ratio portfolio.
#[derive(Clone, Debug)]
pub struct MaxSharpe {
  pub optimizer: MeanVarianceOptimizer,
  pub risk_free: f64,
  pub kappa_max: f64,
  pub kappa_init: f64,
}

impl Default for MaxSharpe {
  fn default() -> Self {
    Self {
      optimizer: MeanVarianceOptimizer::default(),
      risk_free: 0.0,
      kappa_max: 1000.0,
      kappa_init: 1.0,
    }
  }
}

impl Optimizer for MaxSharpe {
  fn name(&self) -> &str {
    "max-sharpe"
  }

  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>> {
    let p = self
      .optimizer
      .max_sharpe(window, self.risk_free, self.kappa_max, self.kappa_init)?;
    Ok(p.weights)
  }
}

/// Source of the risk-aversion coefficient `δ`.
#[derive(Clone, Debug, PartialEq)]
pub enum RiskAversion {
  Fixed(f64),
  /// Implied from a market index over the dates of each window.
  Implied {
    index: Vec<(NaiveDate, f64)>,
    trading_days: usize,
  },
}

/// Runtime configuration for [`BlackLittermanStrategy`].
#[derive(Clone, Debug)]
pub struct BlackLittermanConfig {
  /// Prior uncertainty scale.
  pub tau: f64,
  pub risk_aversion: RiskAversion,
  pub risk_free: f64,
}

impl Default for BlackLittermanConfig {
  fn default() -> Self {
    Self {
      tau: 0.05,
      risk_aversion: RiskAversion::Fixed(2.5),
      risk_free: 0.0,
    }
  }
}

/// Black-Litterman weights from market caps and named views, re-estimated per window.
#[derive(Clone, Debug)]
pub struct BlackLittermanStrategy {
  config: BlackLittermanConfig,
  estimator: StatisticsEstimator,
  market_caps: HashMap<String, f64>,
  views: Vec<View>,
}

impl BlackLittermanStrategy {
  pub fn new(
    config: BlackLittermanConfig,
    market_caps: HashMap<String, f64>,
    views: Vec<View>,
  ) -> Result<Self> {
    if !(config.tau.is_finite() && config.tau > 0.0) {
      return Err(PortfolioError::invalid(format!(
        "tau must be positive, got {}",
        config.tau
      )));
    }
    if let RiskAversion::Fixed(delta) = config.risk_aversion {
      if !(delta.is_finite() && delta > 0.0) {
        return Err(PortfolioError::invalid(format!(
          "risk aversion must be positive, got {delta}"
        )));
      }
    }

    Ok(Self {
      config,
      estimator: StatisticsEstimator::default(),
      market_caps,
      views,
    })
  }

  pub fn with_estimator(mut self, estimator: StatisticsEstimator) -> Self {
    self.estimator = estimator;
    self
  }

  pub fn config(&self) -> &BlackLittermanConfig {
    &self.config
  }

  fn risk_aversion(&self, window: &PriceHistory) -> Result<f64> {
    match &self.config.risk_aversion {
      RiskAversion::Fixed(delta) => Ok(*delta),
      RiskAversion::Implied {
        index,
        trading_days,
      } => {
        let (first, last) = match (window.dates().first(), window.dates().last()) {
          (Some(first), Some(last)) => (*first, *last),
          _ => return Err(PortfolioError::invalid("empty price window")),
        };
        let prices: Vec<f64> = index
          .iter()
          .filter(|(d, _)| (first..=last).contains(d))
          .map(|(_, p)| *p)
          .collect();
        let delta = implied_risk_aversion(&prices, *trading_days, self.config.risk_free)?;
        if delta <= 0.0 {
          return Err(PortfolioError::invalid(format!(
            "implied risk aversion {delta:.4} is not positive"
          )));
        }
        Ok(delta)
      }
    }
  }
}

impl Optimizer for BlackLittermanStrategy {
  fn name(&self) -> &str {
    "black-litterman"
  }

  fn optimize(&self, window: &PriceHistory) -> Result<DVector<f64>> {
    let ctx = self.estimator.estimate(window)?;
    let delta = self.risk_aversion(window)?;
    let w_mkt = market_weights(&self.market_caps, ctx.assets())?;
    let prior = equilibrium_prior(&w_mkt, delta, ctx.covariance(), self.config.risk_free)?;
    let engine = BlackLittermanEngine::from_context(&ctx, prior, self.config.tau)?;

    let (usable, dropped): (Vec<View>, Vec<View>) = self
      .views
      .iter()
      .cloned()
      .partition(|v| v.involves_only(ctx.assets()));
    if !dropped.is_empty() {
      debug!(dropped = dropped.len(), "views on assets outside the window ignored");
    }

    let views = ViewSpecification::from_views(ctx.assets(), &usable)?;
    engine.portfolio_weights(delta, &views)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::types::is_feasible;

  fn window() -> PriceHistory {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let dates = (0..6)
      .map(|i| start + chrono::Days::new(i))
      .collect();
    PriceHistory::from_columns(
      dates,
      vec![
        ("A".to_string(), vec![100.0, 101.0, 100.0, 102.0, 103.0, 102.5]),
        ("B".to_string(), vec![50.0, 50.5, 51.5, 51.0, 52.0, 53.0]),
        ("C".to_string(), vec![20.0, 19.5, 20.5, 20.0, 21.0, 20.5]),
      ],
    )
    .unwrap()
  }

  fn caps() -> HashMap<String, f64> {
    [("A", 5.0), ("B", 3.0), ("C", 2.0)]
      .into_iter()
      .map(|(a, c)| (a.to_string(), c))
      .collect()
  }

  #[test]
  fn equal_weight_and_closures() {
    let w = EqualWeight.optimize(&window()).unwrap();
    assert_abs_diff_eq!(w[1], 1.0 / 3.0, epsilon = 1e-15);

    let first_only = |win: &PriceHistory| -> Result<DVector<f64>> {
      let mut w = DVector::zeros(win.n_assets());
      w[0] = 1.0;
      Ok(w)
    };
    assert_eq!(first_only.name(), "custom");
    assert_eq!(first_only.optimize(&window()).unwrap()[0], 1.0);
  }

  #[test]
  fn mean_variance_strategies_are_feasible() {
    let strategies: Vec<Box<dyn Optimizer>> = vec![
      Box::new(MinimumVariance::default()),
      Box::new(MaxSharpe::default()),
    ];
    for s in &strategies {
      let w = s.optimize(&window()).unwrap();
      assert_eq!(w.len(), 3);
      assert!(is_feasible(&w, 1e-6), "{} produced {w}", s.name());
    }
  }

  #[test]
  fn black_litterman_without_views_holds_the_market() {
    let s = BlackLittermanStrategy::new(BlackLittermanConfig::default(), caps(), vec![]).unwrap();
    let w = s.optimize(&window()).unwrap();
    assert_abs_diff_eq!(w[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(w[1], 0.3, epsilon = 1e-6);
    assert_abs_diff_eq!(w[2], 0.2, epsilon = 1e-6);
  }

  #[test]
  fn views_outside_the_window_are_ignored() {
    let views = vec![View::absolute("Z", 0.5)];
    let s = BlackLittermanStrategy::new(BlackLittermanConfig::default(), caps(), views).unwrap();
    let w = s.optimize(&window()).unwrap();
    assert_abs_diff_eq!(w[0], 0.5, epsilon = 1e-6);
  }

  #[test]
  fn missing_market_cap_is_an_input_error() {
    let mut caps = caps();
    caps.remove("C");
    let s = BlackLittermanStrategy::new(BlackLittermanConfig::default(), caps, vec![]).unwrap();
    assert!(matches!(
      s.optimize(&window()),
      Err(PortfolioError::InvalidInput(_))
    ));
  }

  #[test]
  fn implied_risk_aversion_uses_window_dates() {
    let w = window();
    let index: Vec<(NaiveDate, f64)> = w
      .dates()
      .iter()
      .zip([100.0, 100.4, 100.1, 100.9, 101.5, 101.6])
      .map(|(d, p)| (*d, p))
      .collect();
    let config = BlackLittermanConfig {
      risk_aversion: RiskAversion::Implied {
        index,
        trading_days: 252,
      },
      ..BlackLittermanConfig::default()
    };
    let s = BlackLittermanStrategy::new(config, caps(), vec![]).unwrap();
    assert!(s.risk_aversion(&w).unwrap() > 0.0);
    assert!(is_feasible(&s.optimize(&w).unwrap(), 1e-6));
  }

  #[test]
  fn invalid_config_is_rejected() {
    let config = BlackLittermanConfig {
      tau: 0.0,
      ..BlackLittermanConfig::default()
    };
    assert!(BlackLittermanStrategy::new(config, caps(), vec![]).is_err());
  }
}
