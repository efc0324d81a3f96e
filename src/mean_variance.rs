//! # Mean-Variance Optimizer
//!
//! $$
//! \min_{\mathbf w}\ \mathbf w^\top\Sigma\mathbf w
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w = 1,\ \ \mu^\top\mathbf w = r^\*,\ \ l\le\mathbf w\le u
//! $$
//!
//! Target-return minimum variance, the efficient frontier between the
//! minimum-variance and maximum-return portfolios, and the maximum-Sharpe
//! portfolio through the scale-variable reformulation
//!
//! $$
//! \min_{\mathbf y,\kappa}\ \mathbf y^\top\Sigma\mathbf y
//! \quad\text{s.t.}\quad (\mu-r_f)^\top\mathbf y = 1,\ \ \mathbf 1^\top\mathbf y = \kappa,\ \ \kappa\ge 10^{-6},
//! \qquad \mathbf w = \mathbf y/\kappa
//! $$

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::solver::ClarabelSolver;
use crate::solver::QpSolution;
use crate::solver::QpSolver;
use crate::solver::QuadraticProgram;
use crate::stats::StatisticsEstimator;
use crate::types::PortfolioContext;
use crate::types::PriceHistory;
use crate::types::finalize_weights;

/// Smallest admissible value of the max-Sharpe scale variable.
pub const KAPPA_FLOOR: f64 = 1e-6;

/// Box bounds applied to every weight.
#[derive(Clone, Debug)]
pub struct MeanVarianceConfig {
  pub lower_bound: f64,
  pub upper_bound: f64,
}

impl Default for MeanVarianceConfig {
  fn default() -> Self {
    Self {
      lower_bound: 0.0,
      upper_bound: 1.0,
    }
  }
}

impl MeanVarianceConfig {
  pub fn validate(&self) -> Result<()> {
    if !self.lower_bound.is_finite() || !self.upper_bound.is_finite() {
      return Err(PortfolioError::invalid("weight bounds must be finite"));
    }
    if self.lower_bound > self.upper_bound {
      return Err(PortfolioError::invalid(format!(
        "lower bound {} exceeds upper bound {}",
        self.lower_bound, self.upper_bound
      )));
    }
    Ok(())
  }
}

/// Solved portfolio with its moments under the estimation context.
#[derive(Clone, Debug)]
pub struct OptimizedPortfolio {
  /// Cleaned, fully invested weights in context asset order.
  pub weights: DVector<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  /// Solver iterations.
  pub iterations: usize,
}

/// Result of the maximum-Sharpe problem.
#[derive(Clone, Debug)]
pub struct SharpePortfolio {
  pub sharpe: f64,
  pub weights: DVector<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  /// Recovered scale variable.
  pub kappa: f64,
  pub iterations: usize,
}

/// One solved point of the frontier sweep.
#[derive(Clone, Debug)]
pub struct FrontierPoint {
  pub target: f64,
  pub risk: f64,
  pub ret: f64,
  pub weights: DVector<f64>,
}

/// Frontier points in increasing target order, plus the targets whose solve failed.
#[derive(Clone, Debug, Default)]
pub struct EfficientFrontier {
  pub points: Vec<FrontierPoint>,
  pub failed_targets: Vec<f64>,
}

impl EfficientFrontier {
  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// `(risk, return)` pairs for plotting sinks.
  pub fn risk_return(&self) -> Vec<(f64, f64)> {
    self.points.iter().map(|p| (p.risk, p.ret)).collect()
  }
}

/// Long-only Markowitz optimizer over a pluggable QP solver.
#[derive(Clone, Debug)]
pub struct MeanVarianceOptimizer<S = ClarabelSolver> {
  config: MeanVarianceConfig,
  estimator: StatisticsEstimator,
  solver: S,
}

impl Default for MeanVarianceOptimizer {
  fn default() -> Self {
    Self {
      config: MeanVarianceConfig::default(),
      estimator: StatisticsEstimator::default(),
      solver: ClarabelSolver::default(),
    }
  }
}

impl MeanVarianceOptimizer<ClarabelSolver> {
  pub fn new(config: MeanVarianceConfig) -> Result<Self> {
    Self::with_parts(config, StatisticsEstimator::default(), ClarabelSolver::default())
  }
}

impl<S: QpSolver> MeanVarianceOptimizer<S> {
  pub fn with_parts(
    config: MeanVarianceConfig,
    estimator: StatisticsEstimator,
    solver: S,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      config,
      estimator,
      solver,
    })
  }

  pub fn config(&self) -> &MeanVarianceConfig {
    &self.config
  }

  pub fn estimator(&self) -> &StatisticsEstimator {
    &self.estimator
  }

  /// Estimate the context of a price window.
  pub fn context(&self, window: &PriceHistory) -> Result<PortfolioContext> {
    self.estimator.estimate(window)
  }

  /// Minimum variance for a target expected return.
  pub fn solve_target_return(
    &self,
    ctx: &PortfolioContext,
    target: f64,
  ) -> Result<OptimizedPortfolio> {
    if !target.is_finite() {
      return Err(PortfolioError::invalid("target return must be finite"));
    }

    let n = non_empty(ctx)?;
    let mut eq = DMatrix::from_element(2, n, 1.0);
    eq.set_row(1, &ctx.expected_returns().transpose());
    let qp = self.budget_program(
      ctx,
      variance_hessian(ctx),
      DVector::zeros(n),
      eq,
      DVector::from_vec(vec![1.0, target]),
    );

    let sol = self.run(&qp, || format!("target return {target:.6}"))?;
    portfolio(ctx, &sol)
  }

  /// Global minimum-variance portfolio under the budget and box constraints.
  pub fn solve_min_variance(&self, ctx: &PortfolioContext) -> Result<OptimizedPortfolio> {
    let n = non_empty(ctx)?;
    let qp = self.budget_program(
      ctx,
      variance_hessian(ctx),
      DVector::zeros(n),
      DMatrix::from_element(1, n, 1.0),
      DVector::from_element(1, 1.0),
    );
    let sol = self.run(&qp, || "minimum variance".to_string())?;
    portfolio(ctx, &sol)
  }

  /// Highest attainable expected return under the budget and box constraints.
  pub fn solve_max_return(&self, ctx: &PortfolioContext) -> Result<OptimizedPortfolio> {
    let n = non_empty(ctx)?;
    let qp = self.budget_program(
      ctx,
      DMatrix::zeros(n, n),
      -ctx.expected_returns(),
      DMatrix::from_element(1, n, 1.0),
      DVector::from_element(1, 1.0),
    );
    let sol = self.run(&qp, || "maximum return".to_string())?;
    portfolio(ctx, &sol)
  }

  /// Lazily solve `num_points` evenly spaced targets between the minimum-variance
  /// return and the maximum return.
  pub fn sweep<'a>(
    &'a self,
    ctx: &'a PortfolioContext,
    num_points: usize,
  ) -> Result<impl Iterator<Item = (f64, Result<OptimizedPortfolio>)> + 'a> {
    if num_points == 0 {
      return Err(PortfolioError::invalid("frontier needs at least one point"));
    }

    let low = self.solve_min_variance(ctx)?.expected_return;
    let high = self.solve_max_return(ctx)?.expected_return;
    debug!(low, high, num_points, "frontier target range");

    Ok(linspace(low, high, num_points).map(move |target| {
      let result = self.solve_target_return(ctx, target);
      (target, result)
    }))
  }

  /// Efficient frontier; failed targets are dropped from the points and reported.
  pub fn frontier(&self, ctx: &PortfolioContext, num_points: usize) -> Result<EfficientFrontier> {
    let mut frontier = EfficientFrontier::default();

    for (target, result) in self.sweep(ctx, num_points)? {
      match result {
        Ok(p) => frontier.points.push(FrontierPoint {
          target,
          risk: p.volatility,
          ret: p.expected_return,
          weights: p.weights,
        }),
        Err(err) => {
          debug!(target, %err, "dropping frontier point");
          frontier.failed_targets.push(target);
        }
      }
    }

    Ok(frontier)
  }

  /// Maximum Sharpe ratio via the scale-variable reformulation.
  ///
  /// Variables are `(y, κ)` with `y = κ·w`, `κ ∈ [1e-6, kappa_max]` and the
  /// configured weight box applied as `l·κ ≤ y ≤ u·κ`. `kappa_init` is checked
  /// against the same range; the interior-point solver picks its own start.
  /// Fails with [`PortfolioError::Convergence`] when no asset earns more than
  /// `risk_free`.
  pub fn solve_max_sharpe(
    &self,
    ctx: &PortfolioContext,
    risk_free: f64,
    kappa_max: f64,
    kappa_init: f64,
  ) -> Result<SharpePortfolio> {
    if !risk_free.is_finite() {
      return Err(PortfolioError::invalid("risk-free rate must be finite"));
    }
    if !(kappa_max.is_finite() && kappa_max > KAPPA_FLOOR) {
      return Err(PortfolioError::invalid(format!(
        "kappa_max must exceed {KAPPA_FLOOR}, got {kappa_max}"
      )));
    }
    if !(KAPPA_FLOOR..=kappa_max).contains(&kappa_init) {
      return Err(PortfolioError::invalid(format!(
        "kappa_init must lie in [{KAPPA_FLOOR}, {kappa_max}], got {kappa_init}"
      )));
    }

    let n = non_empty(ctx)?;
    let sigma = variance_hessian(ctx);
    let hessian = DMatrix::from_fn(n + 1, n + 1, |i, j| {
      if i < n && j < n {
        sigma[(i, j)]
      } else {
        0.0
      }
    });

    let excess = ctx.expected_returns().add_scalar(-risk_free);
    let mut eq = DMatrix::zeros(2, n + 1);
    for j in 0..n {
      eq[(0, j)] = excess[j];
      eq[(1, j)] = 1.0;
    }
    eq[(1, n)] = -1.0;

    let mut lower = DVector::from_element(n + 1, self.config.lower_bound.min(0.0) * kappa_max);
    let mut upper = DVector::from_element(n + 1, self.config.upper_bound.max(0.0) * kappa_max);
    lower[n] = KAPPA_FLOOR;
    upper[n] = kappa_max;

    // l·κ <= y_i <= u·κ keeps w = y/κ inside the weight box
    let mut box_rows = DMatrix::zeros(2 * n, n + 1);
    for i in 0..n {
      box_rows[(i, i)] = 1.0;
      box_rows[(i, n)] = -self.config.upper_bound;
      box_rows[(n + i, i)] = -1.0;
      box_rows[(n + i, n)] = self.config.lower_bound;
    }

    let qp = QuadraticProgram::new(
      hessian,
      DVector::zeros(n + 1),
      eq,
      DVector::from_vec(vec![1.0, 0.0]),
      lower,
      upper,
    )
    .with_inequalities(box_rows, DVector::zeros(2 * n));
    let sol = self.run(&qp, || format!("max sharpe (rf {risk_free})"))?;

    let kappa = sol.x[n];
    let recovered = sol.x.rows(0, n).into_owned() / kappa;
    let weights = finalize_weights(&recovered).ok_or_else(|| PortfolioError::Convergence {
      problem: "max sharpe weight recovery".to_string(),
      iterations: sol.iterations,
      residual: sol.residual,
    })?;

    Ok(SharpePortfolio {
      sharpe: ctx.sharpe_ratio(&weights, risk_free),
      expected_return: ctx.portfolio_return(&weights),
      volatility: ctx.portfolio_volatility(&weights),
      weights,
      kappa,
      iterations: sol.iterations,
    })
  }

  pub fn minimum_variance_for_target(
    &self,
    window: &PriceHistory,
    target: f64,
  ) -> Result<OptimizedPortfolio> {
    self.solve_target_return(&self.context(window)?, target)
  }

  pub fn minimum_variance(&self, window: &PriceHistory) -> Result<OptimizedPortfolio> {
    self.solve_min_variance(&self.context(window)?)
  }

  pub fn maximum_return(&self, window: &PriceHistory) -> Result<OptimizedPortfolio> {
    self.solve_max_return(&self.context(window)?)
  }

  pub fn efficient_frontier(
    &self,
    window: &PriceHistory,
    num_points: usize,
  ) -> Result<EfficientFrontier> {
    self.frontier(&self.context(window)?, num_points)
  }

  pub fn max_sharpe(
    &self,
    window: &PriceHistory,
    risk_free: f64,
    kappa_max: f64,
    kappa_init: f64,
  ) -> Result<SharpePortfolio> {
    self.solve_max_sharpe(&self.context(window)?, risk_free, kappa_max, kappa_init)
  }

  fn budget_program(
    &self,
    ctx: &PortfolioContext,
    hessian: DMatrix<f64>,
    linear: DVector<f64>,
    eq: DMatrix<f64>,
    rhs: DVector<f64>,
  ) -> QuadraticProgram {
    let n = ctx.n_assets();
    QuadraticProgram::new(
      hessian,
      linear,
      eq,
      rhs,
      DVector::from_element(n, self.config.lower_bound),
      DVector::from_element(n, self.config.upper_bound),
    )
  }

  fn run(&self, qp: &QuadraticProgram, label: impl FnOnce() -> String) -> Result<QpSolution> {
    self.solver.solve(qp).map_err(|err| match err {
      PortfolioError::Convergence {
        iterations,
        residual,
        ..
      } => PortfolioError::Convergence {
        problem: label(),
        iterations,
        residual,
      },
      other => other,
    })
  }
}

fn non_empty(ctx: &PortfolioContext) -> Result<usize> {
  match ctx.n_assets() {
    0 => Err(PortfolioError::invalid("portfolio context has no assets")),
    n => Ok(n),
  }
}

/// `2Σ` symmetrized, so that `½wᵗHw = wᵗΣw`.
fn variance_hessian(ctx: &PortfolioContext) -> DMatrix<f64> {
  let sigma = ctx.covariance();
  sigma + sigma.transpose()
}

fn portfolio(ctx: &PortfolioContext, sol: &QpSolution) -> Result<OptimizedPortfolio> {
  let weights = finalize_weights(&sol.x).ok_or_else(|| PortfolioError::Convergence {
    problem: "weight normalization".to_string(),
    iterations: sol.iterations,
    residual: sol.residual,
  })?;

  Ok(OptimizedPortfolio {
    expected_return: ctx.portfolio_return(&weights),
    volatility: ctx.portfolio_volatility(&weights),
    weights,
    iterations: sol.iterations,
  })
}

fn linspace(start: f64, end: f64, n: usize) -> impl Iterator<Item = f64> {
  let step = if n > 1 {
    (end - start) / (n - 1) as f64
  } else {
    0.0
  };
  (0..n).map(move |i| if i + 1 == n && n > 1 { end } else { start + step * i as f64 })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::types::is_feasible;

  fn optimizer() -> MeanVarianceOptimizer {
    MeanVarianceOptimizer::default()
  }

  fn two_assets() -> PortfolioContext {
    PortfolioContext::new(
      vec!["LOW".to_string(), "HIGH".to_string()],
      DVector::from_vec(vec![0.08, 0.12]),
      DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.09]),
    )
    .unwrap()
  }

  fn four_assets() -> PortfolioContext {
    let vol = [0.15, 0.2, 0.25, 0.3];
    let corr = [
      [1.0, 0.3, 0.2, 0.1],
      [0.3, 1.0, 0.4, 0.2],
      [0.2, 0.4, 1.0, 0.3],
      [0.1, 0.2, 0.3, 1.0],
    ];
    let cov = DMatrix::from_fn(4, 4, |i, j| corr[i][j] * vol[i] * vol[j]);
    PortfolioContext::new(
      (0..4).map(|i| format!("A{i}")).collect(),
      DVector::from_vec(vec![0.05, 0.07, 0.1, 0.11]),
      cov,
    )
    .unwrap()
  }

  #[test]
  fn target_return_on_two_uncorrelated_assets() {
    // budget and target pin w1 = (0.12 - 0.10) / (0.12 - 0.08)
    let opt = optimizer();
    let p = opt.solve_target_return(&two_assets(), 0.10).unwrap();
    assert_abs_diff_eq!(p.weights[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(p.weights[1], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(p.volatility, (0.25f64 * 0.04 + 0.25 * 0.09).sqrt(), epsilon = 1e-6);
  }

  #[test]
  fn global_minimum_variance_is_inverse_variance() {
    let opt = optimizer();
    let p = opt.solve_min_variance(&two_assets()).unwrap();
    assert_abs_diff_eq!(p.weights[0], 0.09 / 0.13, epsilon = 1e-6);
    assert!(is_feasible(&p.weights, 1e-9));
  }

  #[test]
  fn maximum_return_is_the_best_asset() {
    let opt = optimizer();
    let p = opt.solve_max_return(&four_assets()).unwrap();
    assert_abs_diff_eq!(p.weights[3], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(p.expected_return, 0.11, epsilon = 1e-6);
  }

  #[test]
  fn unreachable_target_is_a_convergence_failure() {
    let opt = optimizer();
    let err = opt.solve_target_return(&two_assets(), 0.5).unwrap_err();
    match err {
      PortfolioError::Convergence { problem, .. } => assert!(problem.contains("target return")),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn frontier_risk_grows_with_target() {
    let opt = optimizer();
    let ctx = four_assets();
    let frontier = opt.frontier(&ctx, 25).unwrap();

    // the top target is a single vertex and may be dropped
    assert_eq!(frontier.len() + frontier.failed_targets.len(), 25);
    assert!(frontier.len() >= 24);
    for p in &frontier.points {
      assert!(is_feasible(&p.weights, 1e-6));
      assert_abs_diff_eq!(p.ret, p.target, epsilon = 1e-5);
    }
    for pair in frontier.points.windows(2) {
      assert!(pair[1].target > pair[0].target);
      assert!(pair[1].risk >= pair[0].risk - 1e-5);
    }
  }

  #[test]
  fn max_sharpe_of_uncorrelated_pair() {
    // w ∝ Σ⁻¹μ = (2, 4/3)
    let opt = optimizer();
    let p = opt.solve_max_sharpe(&two_assets(), 0.0, 1000.0, 1.0).unwrap();
    assert_abs_diff_eq!(p.weights[0], 0.6, epsilon = 1e-6);
    assert_abs_diff_eq!(p.weights[1], 0.4, epsilon = 1e-6);
    assert!(p.kappa >= KAPPA_FLOOR);
    assert_abs_diff_eq!(p.sharpe, (0.048f64 + 0.048) / (0.36f64 * 0.04 + 0.16 * 0.09).sqrt(), epsilon = 1e-5);
  }

  #[test]
  fn max_sharpe_dominates_the_frontier() {
    let opt = optimizer();
    let ctx = four_assets();
    let rf = 0.02;
    let best = opt.solve_max_sharpe(&ctx, rf, 1000.0, 1.0).unwrap();
    let frontier = opt.frontier(&ctx, 40).unwrap();

    assert!(is_feasible(&best.weights, 1e-6));
    for p in &frontier.points {
      assert!(best.sharpe >= ctx.sharpe_ratio(&p.weights, rf) - 1e-5);
    }
  }

  #[test]
  fn max_sharpe_without_positive_excess_return_fails() {
    let opt = optimizer();
    let err = opt.solve_max_sharpe(&two_assets(), 0.2, 1000.0, 1.0).unwrap_err();
    assert!(err.is_convergence());
  }

  fn boxed(lower_bound: f64, upper_bound: f64) -> MeanVarianceOptimizer {
    MeanVarianceOptimizer::new(MeanVarianceConfig {
      lower_bound,
      upper_bound,
    })
    .unwrap()
  }

  fn assert_within(w: &DVector<f64>, lower: f64, upper: f64) {
    for &x in w.iter() {
      assert!(x >= lower - 1e-5 && x <= upper + 1e-5, "{x} outside [{lower}, {upper}] in {w}");
    }
    assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-6);
  }

  #[test]
  fn max_sharpe_respects_a_narrowed_box() {
    // the unconstrained tangency (0.6, 0.4) is cut at 0.55
    let opt = boxed(0.0, 0.55);
    let p = opt.solve_max_sharpe(&two_assets(), 0.0, 1000.0, 1.0).unwrap();
    assert_within(&p.weights, 0.0, 0.55);
    assert_abs_diff_eq!(p.weights[0], 0.55, epsilon = 1e-6);
    assert_abs_diff_eq!(p.weights[1], 0.45, epsilon = 1e-6);

    let gmv = opt.solve_min_variance(&two_assets()).unwrap();
    assert_abs_diff_eq!(gmv.weights[0], 0.55, epsilon = 1e-6);
  }

  #[test]
  fn narrowed_box_holds_for_target_and_frontier() {
    let opt = boxed(0.0, 0.4);
    let ctx = four_assets();

    let p = opt.solve_target_return(&ctx, 0.08).unwrap();
    assert_within(&p.weights, 0.0, 0.4);
    assert_abs_diff_eq!(p.expected_return, 0.08, epsilon = 1e-5);

    // best boxed return: 0.4 in each of the two top assets, 0.2 in the next
    let top = opt.solve_max_return(&ctx).unwrap();
    assert_abs_diff_eq!(top.expected_return, 0.4 * 0.11 + 0.4 * 0.1 + 0.2 * 0.07, epsilon = 1e-5);

    let frontier = opt.frontier(&ctx, 15).unwrap();
    assert!(frontier.len() >= 14);
    for point in &frontier.points {
      assert_within(&point.weights, 0.0, 0.4);
    }

    let best = opt.solve_max_sharpe(&ctx, 0.02, 1000.0, 1.0).unwrap();
    assert_within(&best.weights, 0.0, 0.4);
  }

  #[test]
  fn widened_box_allows_bounded_shorts() {
    let long_only = optimizer();
    let opt = boxed(-0.2, 1.2);
    let ctx = four_assets();

    let gmv = opt.solve_min_variance(&ctx).unwrap();
    assert_within(&gmv.weights, -0.2, 1.2);
    assert!(gmv.volatility <= long_only.solve_min_variance(&ctx).unwrap().volatility + 1e-9);

    let p = opt.solve_target_return(&ctx, 0.12).unwrap();
    assert_within(&p.weights, -0.2, 1.2);
    assert!(p.weights.iter().any(|&w| w < 0.0));

    let best = opt.solve_max_sharpe(&ctx, 0.02, 1000.0, 1.0).unwrap();
    assert_within(&best.weights, -0.2, 1.2);
    let long_best = long_only.solve_max_sharpe(&ctx, 0.02, 1000.0, 1.0).unwrap();
    assert!(best.sharpe >= long_best.sharpe - 1e-5);
  }

  #[test]
  fn config_and_argument_validation() {
    let bad = MeanVarianceConfig {
      lower_bound: 0.5,
      upper_bound: 0.1,
    };
    assert!(MeanVarianceOptimizer::new(bad).is_err());

    let opt = optimizer();
    assert!(matches!(
      opt.frontier(&two_assets(), 0),
      Err(PortfolioError::InvalidInput(_))
    ));
    assert!(matches!(
      opt.solve_max_sharpe(&two_assets(), 0.0, 10.0, 20.0),
      Err(PortfolioError::InvalidInput(_))
    ));
  }

  #[test]
  fn linspace_hits_both_ends() {
    let v: Vec<f64> = linspace(0.1, 0.2, 3).collect();
    assert_eq!(v.len(), 3);
    assert_eq!(v[0], 0.1);
    assert_abs_diff_eq!(v[1], 0.15, epsilon = 1e-15);
    assert_eq!(v[2], 0.2);
    assert_eq!(linspace(0.3, 0.4, 1).collect::<Vec<_>>(), vec![0.3]);
  }
}
