//! # Statistics Estimator
//!
//! $$
//! \mu_i^{geo} = \prod_t (1 + r_{t,i})^{D / T_i} - 1,\qquad
//! \Sigma = D \cdot \widehat{\operatorname{Cov}}(r)
//! $$
//!
//! Annualized expected returns and covariance from a price window.

use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::types::PortfolioContext;
use crate::types::PriceHistory;
use crate::types::ReturnSeries;

/// How per-period returns are turned into an annual expected return.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnMode {
  /// Compounded growth rate over the observed periods.
  #[default]
  Geometric,
  /// Arithmetic mean scaled by the number of periods per year.
  Arithmetic,
}

/// Runtime configuration for [`StatisticsEstimator`].
#[derive(Clone, Debug)]
pub struct EstimatorConfig {
  /// Periods per year used for annualization.
  pub trading_days: usize,
  /// Expected-return estimator.
  pub return_mode: ReturnMode,
}

impl Default for EstimatorConfig {
  fn default() -> Self {
    Self {
      trading_days: 252,
      return_mode: ReturnMode::Geometric,
    }
  }
}

impl EstimatorConfig {
  pub fn validate(&self) -> Result<()> {
    if self.trading_days == 0 {
      return Err(PortfolioError::invalid("trading_days must be positive"));
    }
    Ok(())
  }
}

/// Pure estimator of annualized moments.
#[derive(Clone, Debug, Default)]
pub struct StatisticsEstimator {
  config: EstimatorConfig,
}

impl StatisticsEstimator {
  pub fn new(config: EstimatorConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &EstimatorConfig {
    &self.config
  }

  /// Expected returns and covariance of a price window.
  pub fn estimate(&self, window: &PriceHistory) -> Result<PortfolioContext> {
    let returns = window.returns();
    self.estimate_returns(&returns)
  }

  /// Expected returns and covariance of an already computed return table.
  pub fn estimate_returns(&self, returns: &ReturnSeries) -> Result<PortfolioContext> {
    if returns.n_assets() < 2 {
      return Err(PortfolioError::invalid(format!(
        "at least 2 assets are required, found {}",
        returns.n_assets()
      )));
    }
    if returns.len() < 2 {
      return Err(PortfolioError::invalid(format!(
        "at least 2 return observations are required, found {}",
        returns.len()
      )));
    }

    let mu = self.expected_returns(returns)?;
    let sigma = self.covariance(returns)?;
    PortfolioContext::new(returns.assets().to_vec(), mu, sigma)
  }

  /// Annualized expected return per asset, ignoring missing observations.
  pub fn expected_returns(&self, returns: &ReturnSeries) -> Result<DVector<f64>> {
    let days = self.config.trading_days as f64;
    let mut mu = DVector::zeros(returns.n_assets());

    for j in 0..returns.n_assets() {
      let obs = returns.observed(j);
      if obs.is_empty() {
        return Err(PortfolioError::invalid(format!(
          "asset {} has no return observations",
          returns.assets()[j]
        )));
      }

      mu[j] = match self.config.return_mode {
        ReturnMode::Geometric => {
          let growth: f64 = obs.iter().map(|r| 1.0 + r).product();
          growth.powf(days / obs.len() as f64) - 1.0
        }
        ReturnMode::Arithmetic => obs.iter().sum::<f64>() / obs.len() as f64 * days,
      };
    }

    Ok(mu)
  }

  /// Annualized sample covariance (`n - 1` denominator) over pairwise complete rows.
  pub fn covariance(&self, returns: &ReturnSeries) -> Result<DMatrix<f64>> {
    let days = self.config.trading_days as f64;
    let n = returns.n_assets();
    let values = returns.values();
    let mut sigma = DMatrix::zeros(n, n);

    for i in 0..n {
      for j in i..n {
        let pairs: Vec<(f64, f64)> = (0..returns.len())
          .map(|t| (values[(t, i)], values[(t, j)]))
          .filter(|(a, b)| !a.is_nan() && !b.is_nan())
          .collect();

        if pairs.len() < 2 {
          return Err(PortfolioError::invalid(format!(
            "assets {} and {} share fewer than 2 observations",
            returns.assets()[i],
            returns.assets()[j]
          )));
        }

        let m = pairs.len() as f64;
        let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / m;
        let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / m;
        let cov = pairs
          .iter()
          .map(|(a, b)| (a - mean_a) * (b - mean_b))
          .sum::<f64>()
          / (m - 1.0);

        sigma[(i, j)] = cov * days;
        sigma[(j, i)] = cov * days;
      }
    }

    Ok(sigma)
  }
}
