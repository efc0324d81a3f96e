//! # Errors
//!
//! $$
//! \text{Result}\langle T\rangle = T \;\vert\; \text{PortfolioError}
//! $$
//!
//! Error taxonomy shared by the estimator, the optimizers and the backtest loop.

use thiserror::Error;

/// Errors raised by estimation, optimization and simulation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
  /// Wrong shape or content of a price table, pick matrix, view vector or market caps,
  /// or too few assets/observations to estimate anything.
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Two operands that must agree in size do not.
  #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
  DimensionMismatch {
    context: String,
    expected: usize,
    found: usize,
  },

  /// A matrix that has to be inverted is singular or numerically rank deficient.
  #[error("singular matrix: {0}")]
  SingularMatrix(String),

  /// The constrained solver did not reach a feasible optimum.
  #[error("{problem} did not converge after {iterations} iterations (residual {residual:.3e})")]
  Convergence {
    problem: String,
    iterations: usize,
    residual: f64,
  },

  /// Failure while accounting for a single simulated day.
  #[error("accounting error: {0}")]
  Accounting(String),

  /// Operation called in a state of the backtest lifecycle that does not allow it.
  #[error("invalid simulator state: expected {expected}, found {found}")]
  InvalidState {
    expected: &'static str,
    found: &'static str,
  },
}

impl PortfolioError {
  pub(crate) fn invalid(msg: impl Into<String>) -> Self {
    Self::InvalidInput(msg.into())
  }

  pub(crate) fn dimension(context: impl Into<String>, expected: usize, found: usize) -> Self {
    Self::DimensionMismatch {
      context: context.into(),
      expected,
      found,
    }
  }

  /// Whether the error is a solver failure the caller may recover from.
  pub fn is_convergence(&self) -> bool {
    matches!(self, Self::Convergence { .. })
  }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PortfolioError>;
