//! Candidate strategy configurations and the fixed baselines they must beat.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Trend,
    MeanReversion,
    BuyHold,
    Flat,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Trend => "trend",
            Family::MeanReversion => "mean_reversion",
            Family::BuyHold => "buy_hold",
            Family::Flat => "flat",
        }
    }
}

/// Per-candidate guard thresholds used for the tournament's own safety flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuardThresholds {
    pub max_drawdown_pct: f64,
    pub max_turnover: u64,
}

impl Default for GuardThresholds {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 8.0,
            max_turnover: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub family: Family,
    pub params: BTreeMap<String, f64>,
    pub risk_tags: BTreeSet<String>,
    pub guards: GuardThresholds,
}

impl Candidate {
    pub fn new(id: &str, family: Family, params: &[(&str, f64)], tags: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            family,
            params: params.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            risk_tags: tags.iter().map(|t| t.to_string()).collect(),
            guards: GuardThresholds::default(),
        }
    }

    pub fn with_guards(mut self, guards: GuardThresholds) -> Self {
        self.guards = guards;
        self
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.params.get(key).copied()
    }
}

/// Candidates available for selection, in a stable order.
pub fn candidate_pool() -> Vec<Candidate> {
    vec![
        Candidate::new(
            "trend_fast_5_20",
            Family::Trend,
            &[("fast", 5.0), ("slow", 20.0), ("entry_bps", 5.0), ("size", 0.5)],
            &["trend", "fast"],
        ),
        Candidate::new(
            "trend_mid_10_40",
            Family::Trend,
            &[("fast", 10.0), ("slow", 40.0), ("entry_bps", 5.0), ("size", 0.5)],
            &["trend"],
        ),
        Candidate::new(
            "meanrev_20_30",
            Family::MeanReversion,
            &[("slow", 20.0), ("entry_bps", 30.0), ("size", 0.4)],
            &["mean_reversion", "fast"],
        ),
        Candidate::new(
            "trend_slow_20_80",
            Family::Trend,
            &[("fast", 20.0), ("slow", 80.0), ("entry_bps", 3.0), ("size", 0.5)],
            &["trend", "low_turnover"],
        ),
        Candidate::new(
            "meanrev_40_50",
            Family::MeanReversion,
            &[("slow", 40.0), ("entry_bps", 50.0), ("size", 0.4)],
            &["mean_reversion"],
        ),
        Candidate::new(
            "trend_guarded_12_48",
            Family::Trend,
            &[("fast", 12.0), ("slow", 48.0), ("entry_bps", 8.0), ("size", 0.25)],
            &["trend", "low_risk"],
        )
        .with_guards(GuardThresholds {
            max_drawdown_pct: 4.0,
            max_turnover: 60,
        }),
        Candidate::new(
            "meanrev_60_80",
            Family::MeanReversion,
            &[("slow", 60.0), ("entry_bps", 80.0), ("size", 0.3)],
            &["mean_reversion", "low_turnover"],
        ),
        Candidate::new(
            "trend_tight_8_30",
            Family::Trend,
            &[("fast", 8.0), ("slow", 30.0), ("entry_bps", 2.0), ("size", 0.5)],
            &["trend", "high_turnover"],
        ),
    ]
}

/// Fixed reference strategies used as a performance floor.
pub fn baselines() -> Vec<Candidate> {
    vec![
        Candidate::new("no_trade", Family::Flat, &[], &["baseline"]),
        Candidate::new("buy_hold", Family::BuyHold, &[("size", 0.5)], &["baseline"]),
        Candidate::new(
            "naive_trend",
            Family::Trend,
            &[("fast", 5.0), ("slow", 20.0), ("entry_bps", 0.0), ("size", 0.5)],
            &["baseline"],
        ),
    ]
}

/// Deterministic subset by seed rotation: start at `seed mod N`, take
/// `count` entries, wrapping around the pool.
pub fn select_rotation(pool: &[Candidate], seed: u64, count: usize) -> Vec<Candidate> {
    if pool.is_empty() {
        return Vec::new();
    }
    let n = pool.len();
    let offset = (seed % n as u64) as usize;
    (0..count.min(n)).map(|k| pool[(offset + k) % n].clone()).collect()
}
