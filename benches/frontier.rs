use std::hint::black_box;

use chrono::Days;
use chrono::NaiveDate;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BenchmarkId;
use criterion::Criterion;
use portfolio_opt::BacktestConfig;
use portfolio_opt::BacktestSimulator;
use portfolio_opt::EqualWeight;
use portfolio_opt::MeanVarianceOptimizer;
use portfolio_opt::MinimumVariance;
use portfolio_opt::PriceHistory;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;

fn gbm(n_assets: usize, len: usize) -> PriceHistory {
  let mut rng = StdRng::seed_from_u64(1);
  let normal = rand_distr::Normal::new(0.0, 1.0).unwrap();
  let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
  let dates = (0..len as u64).map(|i| start + Days::new(i)).collect();
  let dt = 1.0 / 252.0;

  let columns = (0..n_assets)
    .map(|j| {
      let mu = 0.05 + 0.01 * j as f64;
      let sigma = 0.10 + 0.02 * j as f64;
      let mut p = 100.0;
      let path = (0..len)
        .map(|_| {
          let cur = p;
          let z: f64 = normal.sample(&mut rng);
          p *= ((mu - 0.5 * sigma * sigma) * dt + sigma * dt.sqrt() * z).exp();
          cur
        })
        .collect();
      (format!("A{j}"), path)
    })
    .collect();

  PriceHistory::from_columns(dates, columns).unwrap()
}

fn bench_frontier(c: &mut Criterion) {
  let mut group = c.benchmark_group("Frontier");
  let optimizer = MeanVarianceOptimizer::default();

  for &n in &[5, 10, 25] {
    let ctx = optimizer.context(&gbm(n, 504)).unwrap();
    group.bench_with_input(BenchmarkId::new("points_20", n), &n, |b, _| {
      b.iter(|| black_box(optimizer.frontier(&ctx, 20).unwrap()));
    });
    group.bench_with_input(BenchmarkId::new("max_sharpe", n), &n, |b, _| {
      b.iter(|| black_box(optimizer.solve_max_sharpe(&ctx, 0.01, 1000.0, 1.0).unwrap()));
    });
  }

  group.finish();
}

fn bench_backtest(c: &mut Criterion) {
  let mut group = c.benchmark_group("Backtest");
  group.sample_size(10);
  let prices = gbm(10, 1260);
  let config = BacktestConfig::default();

  group.bench_function("equal_weight", |b| {
    b.iter(|| {
      let mut sim = BacktestSimulator::new(prices.clone(), config.clone()).unwrap();
      black_box(sim.run(&EqualWeight).unwrap())
    });
  });

  group.bench_function("minimum_variance", |b| {
    let strategy = MinimumVariance::default();
    b.iter(|| {
      let mut sim = BacktestSimulator::new(prices.clone(), config.clone()).unwrap();
      black_box(sim.run(&strategy).unwrap())
    });
  });

  group.finish();
}

criterion_group!(benches, bench_frontier, bench_backtest);
criterion_main!(benches);
