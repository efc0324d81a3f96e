//! # Portfolio Types
//!
//! $$
//! r_{t,i} = \frac{P_{t,i}}{P_{t-1,i}} - 1
//! $$
//!
//! Dated price and return tables, the immutable estimation context handed to the
//! optimizers, and weight-vector helpers. Missing observations are `f64::NAN`.

use std::collections::HashSet;

use chrono::NaiveDate;
use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::error::PortfolioError;
use crate::error::Result;

/// Weights below this value are reported as exactly zero.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Decimal precision of reported weights.
pub const WEIGHT_DECIMALS: i32 = 6;

/// Tolerance used when checking that a weight vector is fully invested.
pub const BUDGET_TOLERANCE: f64 = 1e-6;

/// Price table ordered by date: one row per date, one column per asset.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceHistory {
  dates: Vec<NaiveDate>,
  assets: Vec<String>,
  prices: DMatrix<f64>,
}

impl PriceHistory {
  /// Build a price table, checking that labels match the matrix shape, dates are
  /// strictly increasing and asset names are unique.
  pub fn new(dates: Vec<NaiveDate>, assets: Vec<String>, prices: DMatrix<f64>) -> Result<Self> {
    if prices.nrows() != dates.len() {
      return Err(PortfolioError::dimension(
        "price rows vs dates",
        dates.len(),
        prices.nrows(),
      ));
    }
    if prices.ncols() != assets.len() {
      return Err(PortfolioError::dimension(
        "price columns vs assets",
        assets.len(),
        prices.ncols(),
      ));
    }
    check_labels(&dates, &assets)?;

    Ok(Self {
      dates,
      assets,
      prices,
    })
  }

  /// Build a price table from per-asset columns.
  pub fn from_columns(dates: Vec<NaiveDate>, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
    for (asset, column) in &columns {
      if column.len() != dates.len() {
        return Err(PortfolioError::dimension(
          format!("price column {asset}"),
          dates.len(),
          column.len(),
        ));
      }
    }

    let prices = DMatrix::from_fn(dates.len(), columns.len(), |i, j| columns[j].1[i]);
    let assets = columns.into_iter().map(|(asset, _)| asset).collect();
    Self::new(dates, assets, prices)
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn prices(&self) -> &DMatrix<f64> {
    &self.prices
  }

  /// Number of dates.
  pub fn len(&self) -> usize {
    self.dates.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dates.is_empty()
  }

  pub fn n_assets(&self) -> usize {
    self.assets.len()
  }

  pub fn asset_index(&self, asset: &str) -> Option<usize> {
    self.assets.iter().position(|a| a == asset)
  }

  /// Price column of one asset.
  pub fn column(&self, asset: &str) -> Option<DVector<f64>> {
    self
      .asset_index(asset)
      .map(|j| self.prices.column(j).into_owned())
  }

  /// Rows `[start, end)` of the table.
  pub fn rows(&self, start: usize, end: usize) -> Result<Self> {
    if start > end || end > self.len() {
      return Err(PortfolioError::invalid(format!(
        "row range {start}..{end} outside price history of length {}",
        self.len()
      )));
    }

    Ok(Self {
      dates: self.dates[start..end].to_vec(),
      assets: self.assets.clone(),
      prices: self.prices.rows(start, end - start).into_owned(),
    })
  }

  /// Keep only the named assets, in the order given.
  pub fn select(&self, assets: &[String]) -> Result<Self> {
    let idx = assets
      .iter()
      .map(|a| {
        self
          .asset_index(a)
          .ok_or_else(|| PortfolioError::invalid(format!("unknown asset {a}")))
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(self.select_indices(&idx))
  }

  pub(crate) fn select_indices(&self, idx: &[usize]) -> Self {
    Self {
      dates: self.dates.clone(),
      assets: idx.iter().map(|&j| self.assets[j].clone()).collect(),
      prices: select_columns(&self.prices, idx),
    }
  }

  /// Drop every asset with at least one missing price.
  pub fn complete_assets(&self) -> Self {
    let idx: Vec<usize> = (0..self.n_assets())
      .filter(|&j| self.prices.column(j).iter().all(|p| !p.is_nan()))
      .collect();
    self.select_indices(&idx)
  }

  /// Simple percentage returns. A return is missing when either price is missing;
  /// the leading row and rows where every asset is missing are dropped.
  pub fn returns(&self) -> ReturnSeries {
    let n = self.n_assets();
    let mut dates = Vec::with_capacity(self.len().saturating_sub(1));
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(self.len().saturating_sub(1));

    for t in 1..self.len() {
      let row: Vec<f64> = (0..n)
        .map(|j| self.prices[(t, j)] / self.prices[(t - 1, j)] - 1.0)
        .collect();
      if row.iter().all(|r| r.is_nan()) {
        continue;
      }
      dates.push(self.dates[t]);
      rows.push(row);
    }

    let values = DMatrix::from_fn(rows.len(), n, |i, j| rows[i][j]);
    ReturnSeries {
      dates,
      assets: self.assets.clone(),
      values,
    }
  }
}

/// Simple returns derived from a [`PriceHistory`].
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnSeries {
  dates: Vec<NaiveDate>,
  assets: Vec<String>,
  values: DMatrix<f64>,
}

impl ReturnSeries {
  /// Build a return table directly, with the same label checks as [`PriceHistory::new`].
  pub fn new(dates: Vec<NaiveDate>, assets: Vec<String>, values: DMatrix<f64>) -> Result<Self> {
    if values.nrows() != dates.len() || values.ncols() != assets.len() {
      return Err(PortfolioError::invalid(format!(
        "return table is {}x{} but has {} dates and {} assets",
        values.nrows(),
        values.ncols(),
        dates.len(),
        assets.len()
      )));
    }
    check_labels(&dates, &assets)?;

    Ok(Self {
      dates,
      assets,
      values,
    })
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn values(&self) -> &DMatrix<f64> {
    &self.values
  }

  pub fn len(&self) -> usize {
    self.dates.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dates.is_empty()
  }

  pub fn n_assets(&self) -> usize {
    self.assets.len()
  }

  /// Fraction of non-missing observations per asset.
  pub fn coverage(&self) -> DVector<f64> {
    if self.is_empty() {
      return DVector::zeros(self.n_assets());
    }
    DVector::from_fn(self.n_assets(), |j, _| {
      let present = self.values.column(j).iter().filter(|r| !r.is_nan()).count();
      present as f64 / self.len() as f64
    })
  }

  /// Non-missing observations of one column.
  pub fn observed(&self, j: usize) -> Vec<f64> {
    self
      .values
      .column(j)
      .iter()
      .copied()
      .filter(|r| !r.is_nan())
      .collect()
  }

  pub(crate) fn select_indices(&self, idx: &[usize]) -> Self {
    Self {
      dates: self.dates.clone(),
      assets: idx.iter().map(|&j| self.assets[j].clone()).collect(),
      values: select_columns(&self.values, idx),
    }
  }
}

/// Annualized moments of one estimation window, labelled by asset.
///
/// Computed once per window and passed by reference to every optimization, so
/// independent runs never share mutable estimator state.
#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioContext {
  assets: Vec<String>,
  expected_returns: DVector<f64>,
  covariance: DMatrix<f64>,
}

impl PortfolioContext {
  pub fn new(
    assets: Vec<String>,
    expected_returns: DVector<f64>,
    covariance: DMatrix<f64>,
  ) -> Result<Self> {
    let n = assets.len();
    if expected_returns.len() != n {
      return Err(PortfolioError::dimension(
        "expected returns",
        n,
        expected_returns.len(),
      ));
    }
    if covariance.nrows() != n || covariance.ncols() != n {
      return Err(PortfolioError::dimension(
        "covariance matrix",
        n,
        covariance.nrows().max(covariance.ncols()),
      ));
    }
    if expected_returns.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
      return Err(PortfolioError::invalid(
        "expected returns and covariance must be finite",
      ));
    }

    Ok(Self {
      assets,
      expected_returns,
      covariance,
    })
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn n_assets(&self) -> usize {
    self.assets.len()
  }

  pub fn expected_returns(&self) -> &DVector<f64> {
    &self.expected_returns
  }

  pub fn covariance(&self) -> &DMatrix<f64> {
    &self.covariance
  }

  /// `μᵗw`
  pub fn portfolio_return(&self, w: &DVector<f64>) -> f64 {
    self.expected_returns.dot(w)
  }

  /// `sqrt(wᵗΣw)`
  pub fn portfolio_volatility(&self, w: &DVector<f64>) -> f64 {
    (w.transpose() * &self.covariance * w)[(0, 0)].max(0.0).sqrt()
  }

  /// `(μᵗw - r_f) / sqrt(wᵗΣw)`, zero for a riskless portfolio.
  pub fn sharpe_ratio(&self, w: &DVector<f64>, risk_free: f64) -> f64 {
    let vol = self.portfolio_volatility(w);
    if vol > 1e-15 {
      (self.portfolio_return(w) - risk_free) / vol
    } else {
      0.0
    }
  }
}

/// Equal weights over `n` assets.
pub fn equal_weights(n: usize) -> DVector<f64> {
  if n == 0 {
    return DVector::zeros(0);
  }
  DVector::from_element(n, 1.0 / n as f64)
}

/// Zero out entries smaller than [`WEIGHT_EPSILON`] in magnitude and round to
/// `decimals` places.
pub fn clean_weights(w: &DVector<f64>, decimals: i32) -> DVector<f64> {
  let scale = 10f64.powi(decimals);
  w.map(|x| {
    if x.abs() < WEIGHT_EPSILON {
      0.0
    } else {
      (x * scale).round() / scale
    }
  })
}

/// Rescale to unit sum. `None` when the sum is not positive.
pub fn normalize_weights(w: &DVector<f64>) -> Option<DVector<f64>> {
  let total = w.sum();
  if total > 0.0 && total.is_finite() {
    Some(w / total)
  } else {
    None
  }
}

/// Normalize, clean with [`clean_weights`] and push the rounding residual into the
/// largest weight so the reported vector sums to one.
pub fn finalize_weights(raw: &DVector<f64>) -> Option<DVector<f64>> {
  let mut w = clean_weights(&normalize_weights(raw)?, WEIGHT_DECIMALS);
  if (w.sum() - 1.0).abs() > BUDGET_TOLERANCE {
    w = clean_weights(&normalize_weights(&w)?, WEIGHT_DECIMALS);
  }

  let residual = 1.0 - w.sum();
  let largest = w.imax();
  w[largest] += residual;
  Some(w)
}

/// Long-only, fully invested within `tol`.
pub fn is_feasible(w: &DVector<f64>, tol: f64) -> bool {
  w.iter().all(|&x| x.is_finite() && x >= -tol && x <= 1.0 + tol) && (w.sum() - 1.0).abs() <= tol
}

fn check_labels(dates: &[NaiveDate], assets: &[String]) -> Result<()> {
  if let Some(pair) = dates.windows(2).find(|pair| pair[0] >= pair[1]) {
    return Err(PortfolioError::invalid(format!(
      "dates must be strictly increasing ({} then {})",
      pair[0], pair[1]
    )));
  }

  let mut seen = HashSet::with_capacity(assets.len());
  for asset in assets {
    if !seen.insert(asset.as_str()) {
      return Err(PortfolioError::invalid(format!("duplicate asset {asset}")));
    }
  }
  Ok(())
}

fn select_columns(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
  DMatrix::from_fn(m.nrows(), idx.len(), |i, k| m[(i, idx[k])])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn day(i: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1 + i).unwrap()
  }

  fn sample() -> PriceHistory {
    PriceHistory::from_columns(
      (0..4).map(day).collect(),
      vec![
        ("AAA".to_string(), vec![100.0, 110.0, 99.0, 99.0]),
        ("BBB".to_string(), vec![50.0, f64::NAN, 55.0, 60.5]),
      ],
    )
    .unwrap()
  }

  #[test]
  fn returns_propagate_missing_prices() {
    let r = sample().returns();
    assert_eq!(r.len(), 3);
    assert!((r.values()[(0, 0)] - 0.1).abs() < 1e-12);
    assert!((r.values()[(1, 0)] + 0.1).abs() < 1e-12);
    assert!(r.values()[(0, 1)].is_nan());
    assert!(r.values()[(1, 1)].is_nan());
    assert!((r.values()[(2, 1)] - 0.1).abs() < 1e-12);
    assert_eq!(r.dates()[0], day(1));
  }

  #[test]
  fn all_missing_rows_are_dropped() {
    let prices = PriceHistory::from_columns(
      (0..4).map(day).collect(),
      vec![
        ("AAA".to_string(), vec![1.0, f64::NAN, 1.1, 1.2]),
        ("BBB".to_string(), vec![2.0, f64::NAN, 2.2, 2.4]),
      ],
    )
    .unwrap();
    let r = prices.returns();
    // day 1 and day 2 both involve the missing row
    assert_eq!(r.len(), 1);
    assert_eq!(r.dates(), &[day(3)]);
  }

  #[test]
  fn coverage_counts_present_values() {
    let cov = sample().returns().coverage();
    assert!((cov[0] - 1.0).abs() < 1e-12);
    assert!((cov[1] - 1.0 / 3.0).abs() < 1e-12);
  }

  #[test]
  fn complete_assets_drops_gappy_columns() {
    let full = sample().complete_assets();
    assert_eq!(full.assets(), &["AAA".to_string()]);
    let window = sample().rows(2, 4).unwrap().complete_assets();
    assert_eq!(window.n_assets(), 2);
  }

  #[test]
  fn rejects_unsorted_dates_and_duplicate_assets() {
    let err = PriceHistory::new(
      vec![day(1), day(0)],
      vec!["A".to_string()],
      DMatrix::from_element(2, 1, 1.0),
    );
    assert!(matches!(err, Err(PortfolioError::InvalidInput(_))));

    let err = PriceHistory::new(
      vec![day(0)],
      vec!["A".to_string(), "A".to_string()],
      DMatrix::from_element(1, 2, 1.0),
    );
    assert!(matches!(err, Err(PortfolioError::InvalidInput(_))));
  }

  #[test]
  fn clean_weights_zeroes_dust_and_rounds() {
    let w = DVector::from_vec(vec![0.333_333_44, 5e-7, -1e-9, 0.666_666_1]);
    let c = clean_weights(&w, WEIGHT_DECIMALS);
    assert_eq!(c[1], 0.0);
    assert_eq!(c[2], 0.0);
    assert_eq!(c[0], 0.333_333);
    assert_eq!(c[3], 0.666_666);

    let short = clean_weights(&DVector::from_vec(vec![1.25, -0.250_000_4]), WEIGHT_DECIMALS);
    assert_eq!(short[1], -0.25);
  }

  #[test]
  fn finalize_weights_sums_to_one() {
    let raw = DVector::from_vec(vec![1.0, 1.0, 1.0, 3e-7]);
    let w = finalize_weights(&raw).unwrap();
    assert_eq!(w[3], 0.0);
    assert!(is_feasible(&w, 1e-12));

    assert!(finalize_weights(&DVector::from_vec(vec![-1.0, 0.5])).is_none());
  }

  #[test]
  fn sharpe_of_riskless_portfolio_is_zero() {
    let ctx = PortfolioContext::new(
      vec!["A".to_string()],
      DVector::from_vec(vec![0.05]),
      DMatrix::zeros(1, 1),
    )
    .unwrap();
    assert_eq!(ctx.sharpe_ratio(&DVector::from_vec(vec![1.0]), 0.0), 0.0);
  }
}
