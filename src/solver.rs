//! # Quadratic Programming
//!
//! $$
//! \min_{x}\ \tfrac12 x^\top H x + c^\top x
//! \quad\text{s.t.}\quad A x = b,\ \ G x \le h,\ \ l \le x \le u
//! $$
//!
//! Solver contract used by the mean-variance optimizer, and the default
//! implementation backed by the Clarabel interior-point solver. Equalities map
//! to a zero cone; inequalities and finite bounds map to one nonnegative cone.

use clarabel::algebra::CscMatrix;
use clarabel::solver::DefaultSettingsBuilder;
use clarabel::solver::DefaultSolver;
use clarabel::solver::IPSolver;
use clarabel::solver::SolverStatus;
use clarabel::solver::SupportedConeT;
use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use crate::error::PortfolioError;
use crate::error::Result;

/// Convex quadratic program with linear equalities, linear inequalities and box bounds.
#[derive(Clone, Debug)]
pub struct QuadraticProgram {
  /// Symmetric positive semi-definite `H`.
  pub hessian: DMatrix<f64>,
  /// Linear term `c`.
  pub linear: DVector<f64>,
  /// Equality matrix `A` (one row per constraint).
  pub eq_matrix: DMatrix<f64>,
  /// Equality right-hand side `b`.
  pub eq_rhs: DVector<f64>,
  /// Inequality matrix `G` of `G x <= h`.
  pub ineq_matrix: DMatrix<f64>,
  pub ineq_rhs: DVector<f64>,
  /// Bounds may be infinite; infinite sides add no constraint.
  pub lower: DVector<f64>,
  pub upper: DVector<f64>,
}

impl QuadraticProgram {
  pub fn new(
    hessian: DMatrix<f64>,
    linear: DVector<f64>,
    eq_matrix: DMatrix<f64>,
    eq_rhs: DVector<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
  ) -> Self {
    let n = linear.len();
    Self {
      hessian,
      linear,
      eq_matrix,
      eq_rhs,
      ineq_matrix: DMatrix::zeros(0, n),
      ineq_rhs: DVector::zeros(0),
      lower,
      upper,
    }
  }

  /// Add the rows `G x <= h`.
  pub fn with_inequalities(mut self, matrix: DMatrix<f64>, rhs: DVector<f64>) -> Self {
    self.ineq_matrix = matrix;
    self.ineq_rhs = rhs;
    self
  }

  pub fn n_vars(&self) -> usize {
    self.linear.len()
  }

  pub fn objective(&self, x: &DVector<f64>) -> f64 {
    0.5 * x.dot(&(&self.hessian * x)) + self.linear.dot(x)
  }

  /// Largest absolute violation of `A x = b`.
  pub fn eq_residual(&self, x: &DVector<f64>) -> f64 {
    inf_norm(&(&self.eq_matrix * x - &self.eq_rhs))
  }

  /// Largest violation of any constraint.
  pub fn violation(&self, x: &DVector<f64>) -> f64 {
    let ineq = (&self.ineq_matrix * x - &self.ineq_rhs)
      .iter()
      .fold(0.0_f64, |acc, v| acc.max(*v));
    let bounds = (0..x.len()).fold(0.0_f64, |acc, i| {
      acc
        .max(self.lower[i] - x[i])
        .max(x[i] - self.upper[i])
    });
    self.eq_residual(x).max(ineq).max(bounds)
  }

  fn validate(&self) -> Result<()> {
    let n = self.n_vars();
    if self.hessian.nrows() != n || self.hessian.ncols() != n {
      return Err(PortfolioError::dimension("QP hessian", n, self.hessian.nrows()));
    }
    if self.eq_matrix.ncols() != n {
      return Err(PortfolioError::dimension(
        "QP equality columns",
        n,
        self.eq_matrix.ncols(),
      ));
    }
    if self.eq_matrix.nrows() != self.eq_rhs.len() {
      return Err(PortfolioError::dimension(
        "QP equality rows",
        self.eq_matrix.nrows(),
        self.eq_rhs.len(),
      ));
    }
    if self.ineq_matrix.ncols() != n {
      return Err(PortfolioError::dimension(
        "QP inequality columns",
        n,
        self.ineq_matrix.ncols(),
      ));
    }
    if self.ineq_matrix.nrows() != self.ineq_rhs.len() {
      return Err(PortfolioError::dimension(
        "QP inequality rows",
        self.ineq_matrix.nrows(),
        self.ineq_rhs.len(),
      ));
    }
    if self.lower.len() != n || self.upper.len() != n {
      return Err(PortfolioError::dimension(
        "QP bounds",
        n,
        self.lower.len().min(self.upper.len()),
      ));
    }

    let finite = self
      .hessian
      .iter()
      .chain(self.linear.iter())
      .chain(self.eq_matrix.iter())
      .chain(self.eq_rhs.iter())
      .chain(self.ineq_matrix.iter())
      .chain(self.ineq_rhs.iter())
      .all(|v| v.is_finite());
    if !finite {
      return Err(PortfolioError::invalid("QP data must be finite"));
    }
    if let Some(i) = (0..n).find(|&i| !(self.lower[i] <= self.upper[i])) {
      return Err(PortfolioError::invalid(format!(
        "lower bound {} exceeds upper bound {} for variable {i}",
        self.lower[i], self.upper[i]
      )));
    }
    Ok(())
  }
}

/// Optimal point of a [`QuadraticProgram`].
#[derive(Clone, Debug)]
pub struct QpSolution {
  pub x: DVector<f64>,
  pub objective: f64,
  /// Interior-point iterations used.
  pub iterations: usize,
  /// Largest constraint violation at `x`.
  pub residual: f64,
}

/// Black-box solver contract: an optimal point or a typed failure.
pub trait QpSolver: Send + Sync {
  fn solve(&self, problem: &QuadraticProgram) -> Result<QpSolution>;
}

/// Runtime configuration for [`ClarabelSolver`].
#[derive(Clone, Debug)]
pub struct SolverConfig {
  pub max_iterations: u32,
  /// Absolute and relative duality gap tolerance.
  pub gap_tolerance: f64,
  pub feasibility_tolerance: f64,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      max_iterations: 200,
      gap_tolerance: 1e-8,
      feasibility_tolerance: 1e-8,
    }
  }
}

impl SolverConfig {
  pub fn validate(&self) -> Result<()> {
    if self.max_iterations == 0 {
      return Err(PortfolioError::invalid("solver iteration limit must be positive"));
    }
    if [self.gap_tolerance, self.feasibility_tolerance]
      .iter()
      .any(|v| !(v.is_finite() && *v > 0.0))
    {
      return Err(PortfolioError::invalid("solver tolerances must be positive"));
    }
    Ok(())
  }
}

/// Interior-point QP solver on top of `clarabel`.
#[derive(Clone, Debug, Default)]
pub struct ClarabelSolver {
  config: SolverConfig,
}

impl ClarabelSolver {
  pub fn new(config: SolverConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &SolverConfig {
    &self.config
  }
}

impl QpSolver for ClarabelSolver {
  fn solve(&self, problem: &QuadraticProgram) -> Result<QpSolution> {
    problem.validate()?;
    let n = problem.n_vars();

    // only the upper triangle of the symmetric part is read
    let h = &problem.hessian;
    let p = csc(n, n, |i, j| {
      if i <= j {
        0.5 * (h[(i, j)] + h[(j, i)])
      } else {
        0.0
      }
    });
    let q: Vec<f64> = problem.linear.iter().copied().collect();

    let (a, b, cones) = stack_constraints(problem);

    let settings = DefaultSettingsBuilder::default()
      .max_iter(self.config.max_iterations)
      .tol_gap_abs(self.config.gap_tolerance)
      .tol_gap_rel(self.config.gap_tolerance)
      .tol_feas(self.config.feasibility_tolerance)
      .verbose(false)
      .build()
      .map_err(|e| PortfolioError::invalid(format!("solver settings: {e}")))?;

    let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings)
      .map_err(|e| PortfolioError::invalid(format!("solver setup: {e:?}")))?;
    solver.solve();

    let status = &solver.solution.status;
    let iterations = solver.solution.iterations as usize;
    let raw = DVector::from_column_slice(&solver.solution.x);
    if !matches!(status, SolverStatus::Solved) {
      debug!(?status, iterations, "QP not solved");
      return Err(PortfolioError::Convergence {
        problem: format!("quadratic program ({status:?})"),
        iterations,
        residual: if raw.len() == n {
          problem.violation(&raw)
        } else {
          f64::INFINITY
        },
      });
    }

    // interior points sit within tolerance of the box; snap onto it
    let x = DVector::from_fn(n, |i, _| raw[i].clamp(problem.lower[i], problem.upper[i]));
    Ok(QpSolution {
      objective: problem.objective(&x),
      residual: problem.violation(&x),
      iterations,
      x,
    })
  }
}

/// `[A; G; I_u; -I_l]` with right-hand side `[b; h; u; -l]`, finite bounds only.
fn stack_constraints(
  problem: &QuadraticProgram,
) -> (CscMatrix<f64>, Vec<f64>, Vec<SupportedConeT<f64>>) {
  let n = problem.n_vars();
  let n_eq = problem.eq_matrix.nrows();

  let mut rows: Vec<(Vec<(usize, f64)>, f64)> = Vec::new();
  for k in 0..n_eq {
    rows.push((sparse_row(&problem.eq_matrix, k), problem.eq_rhs[k]));
  }
  for k in 0..problem.ineq_matrix.nrows() {
    rows.push((sparse_row(&problem.ineq_matrix, k), problem.ineq_rhs[k]));
  }
  for i in (0..n).filter(|&i| problem.upper[i].is_finite()) {
    rows.push((vec![(i, 1.0)], problem.upper[i]));
  }
  for i in (0..n).filter(|&i| problem.lower[i].is_finite()) {
    rows.push((vec![(i, -1.0)], -problem.lower[i]));
  }

  let m = rows.len();
  let mut dense = DMatrix::zeros(m, n);
  for (r, (entries, _)) in rows.iter().enumerate() {
    for &(j, v) in entries {
      dense[(r, j)] = v;
    }
  }
  let a = csc(m, n, |i, j| dense[(i, j)]);
  let b = rows.iter().map(|(_, rhs)| *rhs).collect();

  let mut cones = Vec::with_capacity(2);
  if n_eq > 0 {
    cones.push(SupportedConeT::ZeroConeT(n_eq));
  }
  if m > n_eq {
    cones.push(SupportedConeT::NonnegativeConeT(m - n_eq));
  }
  (a, b, cones)
}

fn sparse_row(m: &DMatrix<f64>, k: usize) -> Vec<(usize, f64)> {
  (0..m.ncols())
    .filter(|&j| m[(k, j)] != 0.0)
    .map(|j| (j, m[(k, j)]))
    .collect()
}

/// Column-compressed copy of the non-zero entries of a dense `rows x cols` matrix.
fn csc(rows: usize, cols: usize, entry: impl Fn(usize, usize) -> f64) -> CscMatrix<f64> {
  let mut colptr = Vec::with_capacity(cols + 1);
  let mut rowval = Vec::new();
  let mut nzval = Vec::new();

  colptr.push(0);
  for j in 0..cols {
    for i in 0..rows {
      let v = entry(i, j);
      if v != 0.0 {
        rowval.push(i);
        nzval.push(v);
      }
    }
    colptr.push(nzval.len());
  }

  CscMatrix::new(rows, cols, colptr, rowval, nzval)
}

pub(crate) fn inf_norm(v: &DVector<f64>) -> f64 {
  v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}
