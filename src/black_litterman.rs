//! # Black-Litterman
//!
//! $$
//! \mu_{BL} = \left[(\tau\Sigma)^{-1} + P^\top\Omega^{-1}P\right]^{-1}
//! \left[(\tau\Sigma)^{-1}\pi + P^\top\Omega^{-1}Q\right],
//! \qquad \Omega = \tau_\Omega\, P\Sigma P^\top
//! $$
//!
//! Equilibrium prior from market weights, investor views as a pick matrix and
//! view returns, and the posterior moments and weights that blend them.

use std::collections::HashMap;

use nalgebra::DMatrix;
use nalgebra::DVector;
use nalgebra::Dyn;
use nalgebra::LU;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::types::PortfolioContext;
use crate::types::finalize_weights;

/// Pivot ratio below which a matrix is treated as singular.
const SINGULAR_RATIO: f64 = 1e-14;

/// Market weights `cap_i / Σ cap` in `assets` order.
pub fn market_weights(caps: &HashMap<String, f64>, assets: &[String]) -> Result<DVector<f64>> {
  let mut w = DVector::zeros(assets.len());
  for (i, asset) in assets.iter().enumerate() {
    let cap = *caps
      .get(asset)
      .ok_or_else(|| PortfolioError::invalid(format!("no market cap for {asset}")))?;
    if !cap.is_finite() || cap < 0.0 {
      return Err(PortfolioError::invalid(format!(
        "market cap of {asset} must be finite and non-negative, got {cap}"
      )));
    }
    w[i] = cap;
  }

  let total = w.sum();
  if total <= 0.0 {
    return Err(PortfolioError::invalid("market caps sum to zero"));
  }
  Ok(w / total)
}

/// Reverse-optimized prior `δ·Σ·w_mkt + r_f`.
pub fn equilibrium_prior(
  market_weights: &DVector<f64>,
  risk_aversion: f64,
  sigma: &DMatrix<f64>,
  risk_free: f64,
) -> Result<DVector<f64>> {
  let n = market_weights.len();
  if sigma.nrows() != n || sigma.ncols() != n {
    return Err(PortfolioError::dimension(
      "covariance vs market weights",
      n,
      sigma.nrows().max(sigma.ncols()),
    ));
  }
  if !risk_aversion.is_finite() || !risk_free.is_finite() {
    return Err(PortfolioError::invalid(
      "risk aversion and risk-free rate must be finite",
    ));
  }

  Ok((sigma * market_weights * risk_aversion).add_scalar(risk_free))
}

/// `δ = (mean·D − r_f) / (var·D)` of a market index's simple returns.
pub fn implied_risk_aversion(index_prices: &[f64], trading_days: usize, risk_free: f64) -> Result<f64> {
  if trading_days == 0 {
    return Err(PortfolioError::invalid("trading_days must be positive"));
  }

  let returns: Vec<f64> = index_prices
    .windows(2)
    .map(|p| p[1] / p[0] - 1.0)
    .filter(|r| r.is_finite())
    .collect();
  if returns.len() < 2 {
    return Err(PortfolioError::invalid(format!(
      "market index needs at least 2 returns, found {}",
      returns.len()
    )));
  }

  let days = trading_days as f64;
  let m = returns.len() as f64;
  let mean = returns.iter().sum::<f64>() / m;
  let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (m - 1.0);
  if var <= 0.0 {
    return Err(PortfolioError::invalid("market index has zero variance"));
  }

  Ok((mean * days - risk_free) / (var * days))
}

/// Named view: `Σ weight_i · r_asset_i = expected_return`.
#[derive(Clone, Debug, PartialEq)]
pub struct View {
  pub picks: Vec<(String, f64)>,
  pub expected_return: f64,
}

impl View {
  pub fn absolute(asset: impl Into<String>, expected_return: f64) -> Self {
    Self {
      picks: vec![(asset.into(), 1.0)],
      expected_return,
    }
  }

  /// `long` outperforms `short` by `spread`.
  pub fn relative(long: impl Into<String>, short: impl Into<String>, spread: f64) -> Self {
    Self {
      picks: vec![(long.into(), 1.0), (short.into(), -1.0)],
      expected_return: spread,
    }
  }

  pub fn involves_only(&self, assets: &[String]) -> bool {
    self.picks.iter().all(|(a, _)| assets.contains(a))
  }
}

/// Pick matrix `P` (views × assets) and view returns `Q`.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSpecification {
  pick: DMatrix<f64>,
  returns: DVector<f64>,
}

impl ViewSpecification {
  pub fn new(pick: DMatrix<f64>, returns: DVector<f64>) -> Result<Self> {
    if pick.nrows() != returns.len() {
      return Err(PortfolioError::dimension(
        "pick matrix rows vs view returns",
        pick.nrows(),
        returns.len(),
      ));
    }
    if pick.iter().chain(returns.iter()).any(|v| !v.is_finite()) {
      return Err(PortfolioError::invalid("views must be finite"));
    }
    Ok(Self { pick, returns })
  }

  /// One absolute view per `(asset, expected return)` pair.
  pub fn absolute(assets: &[String], views: &[(String, f64)]) -> Result<Self> {
    let named: Vec<View> = views
      .iter()
      .map(|(asset, q)| View::absolute(asset.clone(), *q))
      .collect();
    Self::from_views(assets, &named)
  }

  pub fn from_views(assets: &[String], views: &[View]) -> Result<Self> {
    let mut pick = DMatrix::zeros(views.len(), assets.len());
    let mut returns = DVector::zeros(views.len());

    for (k, view) in views.iter().enumerate() {
      if view.picks.is_empty() {
        return Err(PortfolioError::invalid(format!("view {k} picks no asset")));
      }
      for (asset, weight) in &view.picks {
        let j = assets
          .iter()
          .position(|a| a == asset)
          .ok_or_else(|| PortfolioError::invalid(format!("view {k} names unknown asset {asset}")))?;
        pick[(k, j)] += weight;
      }
      returns[k] = view.expected_return;
    }

    Self::new(pick, returns)
  }

  pub fn pick(&self) -> &DMatrix<f64> {
    &self.pick
  }

  pub fn returns(&self) -> &DVector<f64> {
    &self.returns
  }

  pub fn n_views(&self) -> usize {
    self.returns.len()
  }

  pub fn is_empty(&self) -> bool {
    self.returns.is_empty()
  }
}

/// Posterior engine with `Σ` and `π` fixed at construction.
#[derive(Clone, Debug)]
pub struct BlackLittermanEngine {
  assets: Vec<String>,
  sigma: DMatrix<f64>,
  prior: DVector<f64>,
  tau: f64,
}

impl BlackLittermanEngine {
  pub fn new(
    assets: Vec<String>,
    sigma: DMatrix<f64>,
    prior: DVector<f64>,
    tau: f64,
  ) -> Result<Self> {
    let n = assets.len();
    if sigma.nrows() != n || sigma.ncols() != n {
      return Err(PortfolioError::dimension(
        "covariance matrix",
        n,
        sigma.nrows().max(sigma.ncols()),
      ));
    }
    if prior.len() != n {
      return Err(PortfolioError::dimension("equilibrium prior", n, prior.len()));
    }
    check_tau(tau)?;

    Ok(Self {
      assets,
      sigma,
      prior,
      tau,
    })
  }

  /// Engine over the assets and covariance of an estimation context.
  pub fn from_context(ctx: &PortfolioContext, prior: DVector<f64>, tau: f64) -> Result<Self> {
    Self::new(ctx.assets().to_vec(), ctx.covariance().clone(), prior, tau)
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn sigma(&self) -> &DMatrix<f64> {
    &self.sigma
  }

  pub fn prior(&self) -> &DVector<f64> {
    &self.prior
  }

  pub fn tau(&self) -> f64 {
    self.tau
  }

  /// `Ω = τ·P·Σ·Pᵗ`.
  pub fn compute_omega(&self, pick: &DMatrix<f64>, tau: f64) -> Result<DMatrix<f64>> {
    check_tau(tau)?;
    if pick.ncols() != self.assets.len() {
      return Err(PortfolioError::dimension(
        "pick matrix columns",
        self.assets.len(),
        pick.ncols(),
      ));
    }
    Ok(pick * &self.sigma * pick.transpose() * tau)
  }

  /// Posterior mean. `tau` defaults to the engine's and `omega` to
  /// [`Self::compute_omega`] with that tau.
  pub fn posterior_expected_returns(
    &self,
    views: &ViewSpecification,
    tau: Option<f64>,
    omega: Option<&DMatrix<f64>>,
  ) -> Result<DVector<f64>> {
    let tau = tau.unwrap_or(self.tau);
    let a = invert(&(&self.sigma * tau), "tau * sigma")?;
    if views.is_empty() {
      return Ok(self.prior.clone());
    }

    let (m, c) = self.view_terms(views, tau, omega)?;
    let lhs = &a + m;
    let rhs = &a * &self.prior + c;
    solve(lhs, &rhs, "posterior precision")
  }

  /// `[(τΣ)⁻¹ + PᵗΩ⁻¹P]⁻¹`.
  pub fn posterior_covariance(
    &self,
    views: &ViewSpecification,
    tau: Option<f64>,
    omega: Option<&DMatrix<f64>>,
  ) -> Result<DMatrix<f64>> {
    let tau = tau.unwrap_or(self.tau);
    let a = invert(&(&self.sigma * tau), "tau * sigma")?;
    if views.is_empty() {
      return invert(&a, "posterior precision");
    }

    let (m, _) = self.view_terms(views, tau, omega)?;
    invert(&(a + m), "posterior precision")
  }

  /// `w ∝ max((δΣ)⁻¹ μ_BL, 0)`, normalized and cleaned.
  pub fn portfolio_weights(&self, risk_aversion: f64, views: &ViewSpecification) -> Result<DVector<f64>> {
    if !(risk_aversion.is_finite() && risk_aversion > 0.0) {
      return Err(PortfolioError::invalid(format!(
        "risk aversion must be positive, got {risk_aversion}"
      )));
    }

    let posterior = self.posterior_expected_returns(views, None, None)?;
    let raw = solve(&self.sigma * risk_aversion, &posterior, "delta * sigma")?;
    // long-only: short positions of the unconstrained solution are dropped
    finalize_weights(&raw.map(|w| w.max(0.0))).ok_or_else(|| {
      PortfolioError::invalid(format!(
        "posterior weights sum to {:.6}, cannot normalize",
        raw.sum()
      ))
    })
  }

  /// `(PᵗΩ⁻¹P, PᵗΩ⁻¹Q)`.
  fn view_terms(
    &self,
    views: &ViewSpecification,
    tau: f64,
    omega: Option<&DMatrix<f64>>,
  ) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let pick = views.pick();
    let omega = match omega {
      Some(o) => {
        let k = views.n_views();
        if o.nrows() != k || o.ncols() != k {
          return Err(PortfolioError::dimension("omega", k, o.nrows().max(o.ncols())));
        }
        o.clone()
      }
      None => self.compute_omega(pick, tau)?,
    };
    if pick.ncols() != self.assets.len() {
      return Err(PortfolioError::dimension(
        "pick matrix columns",
        self.assets.len(),
        pick.ncols(),
      ));
    }

    let omega_inv = invert(&omega, "omega")?;
    let pt_omega_inv = pick.transpose() * omega_inv;
    Ok((&pt_omega_inv * pick, pt_omega_inv * views.returns()))
  }
}

fn check_tau(tau: f64) -> Result<()> {
  if tau.is_finite() && tau > 0.0 {
    Ok(())
  } else {
    Err(PortfolioError::invalid(format!("tau must be positive, got {tau}")))
  }
}

/// LU with a relative pivot check.
fn factor(m: DMatrix<f64>, what: &str) -> Result<LU<f64, Dyn, Dyn>> {
  if m.is_empty() {
    return Err(PortfolioError::SingularMatrix(format!("{what} is empty")));
  }
  let lu = m.lu();
  let pivots = lu.u().diagonal().map(f64::abs);
  let largest = pivots.max();
  if !(largest > 0.0) || pivots.min() <= SINGULAR_RATIO * largest {
    return Err(PortfolioError::SingularMatrix(what.to_string()));
  }
  Ok(lu)
}

fn invert(m: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
  factor(m.clone(), what)?
    .try_inverse()
    .ok_or_else(|| PortfolioError::SingularMatrix(what.to_string()))
}

fn solve(m: DMatrix<f64>, rhs: &DVector<f64>, what: &str) -> Result<DVector<f64>> {
  factor(m, what)?
    .solve(rhs)
    .ok_or_else(|| PortfolioError::SingularMatrix(what.to_string()))
}
