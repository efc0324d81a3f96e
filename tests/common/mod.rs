#![allow(dead_code)]

use chrono::Days;
use chrono::NaiveDate;
use portfolio_opt::PriceHistory;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::Distribution;
use rand_distr::Normal;

pub const TRADING_DAYS: f64 = 252.0;

/// `(name, annual drift, annual volatility)`
pub type AssetSpec<'a> = (&'a str, f64, f64);

pub fn dates(len: usize) -> Vec<NaiveDate> {
  let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
  (0..len as u64)
    .map(|i| start.checked_add_days(Days::new(i)).unwrap())
    .collect()
}

/// Independent geometric Brownian motion paths starting at 100.
pub fn gbm_prices(assets: &[AssetSpec], len: usize, seed: u64) -> PriceHistory {
  let mut rng = StdRng::seed_from_u64(seed);
  let normal = Normal::new(0.0, 1.0).unwrap();
  let dt = 1.0 / TRADING_DAYS;

  let columns = assets
    .iter()
    .map(|&(name, mu, sigma)| {
      let mut path = Vec::with_capacity(len);
      let mut p = 100.0;
      for _ in 0..len {
        path.push(p);
        let z: f64 = normal.sample(&mut rng);
        p *= ((mu - 0.5 * sigma * sigma) * dt + sigma * dt.sqrt() * z).exp();
      }
      (name.to_string(), path)
    })
    .collect();

  PriceHistory::from_columns(dates(len), columns).unwrap()
}

pub fn universe() -> Vec<AssetSpec<'static>> {
  vec![
    ("ALPHA", 0.35, 0.12),
    ("BRAVO", 0.30, 0.18),
    ("CHARLIE", 0.45, 0.25),
    ("DELTA", 0.40, 0.20),
  ]
}
