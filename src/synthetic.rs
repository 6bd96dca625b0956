//! Deterministic, seed-driven quote series.
//!
//! Same seed, same series: walk-forward and stress runs are reproducible
//! without live data.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::series::Quote;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesSpec {
    pub len: usize,
    pub seed: u64,
    pub start_price: f64,
    pub start_ts: u64,
    pub bar_secs: u64,
}

impl SeriesSpec {
    pub fn new(len: usize, seed: u64) -> Self {
        Self {
            len,
            seed,
            start_price: 100.0,
            start_ts: 1_700_000_000,
            bar_secs: 60,
        }
    }
}

pub fn generate(len: usize, seed: u64) -> Vec<Quote> {
    generate_with(&SeriesSpec::new(len, seed))
}

/// Random walk with alternating drift and occasional volatility regime flips.
pub fn generate_with(spec: &SeriesSpec) -> Vec<Quote> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut price = spec.start_price;
    let mut vol: f64 = 0.002;
    let mut series = Vec::with_capacity(spec.len);
    for i in 0..spec.len {
        let regime_flip: f64 = rng.gen();
        if regime_flip < 0.02 {
            vol = (vol * 1.4).min(0.02);
        } else if regime_flip > 0.98 {
            vol = (vol * 0.7).max(0.0008);
        }
        let drift = if i % 240 < 120 { 0.0002 } else { -0.0001 };
        let noise: f64 = rng.gen_range(-1.0..1.0) * vol;
        price = (price * (1.0 + drift + noise)).max(0.01);
        let spread_bps = 1.0 + vol * 500.0 * rng.gen_range(0.5..1.0);
        series.push(Quote {
            ts: spec.start_ts + i as u64 * spec.bar_secs,
            mid: price,
            spread_bps,
        });
    }
    series
}
