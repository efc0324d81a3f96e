//! # portfolio-opt
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Long-only mean-variance and Black-Litterman portfolio construction, and a
//! rolling rebalancing backtest that drives either through a common
//! "price window in, weights out" contract.

pub mod backtest;
pub mod black_litterman;
pub mod error;
pub mod mean_variance;
pub mod metrics;
pub mod solver;
pub mod stats;
pub mod strategy;
pub mod types;

pub use backtest::BacktestConfig;
pub use backtest::BacktestJob;
pub use backtest::BacktestRecord;
pub use backtest::BacktestResult;
pub use backtest::BacktestSimulator;
pub use backtest::FailurePolicy;
pub use backtest::RebalanceEvent;
pub use backtest::RebalanceOutcome;
pub use backtest::SimulatorState;
pub use backtest::SkipReason;
pub use backtest::run_batch;
pub use black_litterman::BlackLittermanEngine;
pub use black_litterman::View;
pub use black_litterman::ViewSpecification;
pub use black_litterman::equilibrium_prior;
pub use black_litterman::implied_risk_aversion;
pub use black_litterman::market_weights;
pub use error::PortfolioError;
pub use error::Result;
pub use mean_variance::EfficientFrontier;
pub use mean_variance::FrontierPoint;
pub use mean_variance::MeanVarianceConfig;
pub use mean_variance::MeanVarianceOptimizer;
pub use mean_variance::OptimizedPortfolio;
pub use mean_variance::SharpePortfolio;
pub use metrics::PerformanceSummary;
pub use solver::ClarabelSolver;
pub use solver::QpSolution;
pub use solver::QpSolver;
pub use solver::QuadraticProgram;
pub use solver::SolverConfig;
pub use stats::EstimatorConfig;
pub use stats::ReturnMode;
pub use stats::StatisticsEstimator;
pub use strategy::BlackLittermanConfig;
pub use strategy::BlackLittermanStrategy;
pub use strategy::EqualWeight;
pub use strategy::MaxSharpe;
pub use strategy::MinimumVariance;
pub use strategy::Optimizer;
pub use strategy::RiskAversion;
pub use strategy::TargetReturn;
pub use types::PortfolioContext;
pub use types::PriceHistory;
pub use types::ReturnSeries;
pub use types::clean_weights;
pub use types::equal_weights;
pub use types::finalize_weights;
pub use types::is_feasible;
pub use types::normalize_weights;
