//! Candidate tournament: simulate candidates and baselines over one segment.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::candidate::{baselines, Candidate};
use crate::friction::FrictionPolicy;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::metrics::{RunMetrics, STARTING_EQUITY};
use crate::registry::RiskOverrides;
use crate::sim::{replay, GuardedSimulator, SimSetup, StepSimulator, StrategySpec};
use crate::series::Quote;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentEntry {
    pub id: String,
    pub family: String,
    pub is_baseline: bool,
    pub score: f64,
    pub metrics: RunMetrics,
    /// Tournament-level safety flag from the candidate's own guards
    pub safety_pass: bool,
    pub safety_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TournamentResult {
    pub entries: Vec<TournamentEntry>,
}

impl TournamentResult {
    /// Highest-scoring non-baseline entry; the earliest wins a tie.
    pub fn best_candidate(&self) -> Option<&TournamentEntry> {
        let mut best: Option<&TournamentEntry> = None;
        for e in self.entries.iter().filter(|e| !e.is_baseline) {
            if best.map_or(true, |b| e.score > b.score) {
                best = Some(e);
            }
        }
        best
    }

    pub fn entry(&self, id: &str) -> Option<&TournamentEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn baseline_scores(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .filter(|e| e.is_baseline)
            .map(|e| (e.id.clone(), e.score))
            .collect()
    }
}

/// Scores candidates (plus the fixed baselines) over a price segment.
pub trait TournamentRunner {
    fn run(&mut self, segment: &[Quote], candidates: &[Candidate], seed: u64) -> Result<TournamentResult>;

    fn baseline_ids(&self) -> Vec<String>;
}

/// Tournament backed by a step simulator.
pub struct SimTournament<S: StepSimulator> {
    sim: S,
    baselines: Vec<Candidate>,
    friction: FrictionPolicy,
    starting_equity: f64,
    max_steps: usize,
    max_reject_rate: f64,
}

impl SimTournament<GuardedSimulator> {
    pub fn guarded(friction: FrictionPolicy, max_steps: usize) -> Self {
        Self::new(GuardedSimulator::new(), friction, max_steps)
    }
}

impl<S: StepSimulator> SimTournament<S> {
    pub fn new(sim: S, friction: FrictionPolicy, max_steps: usize) -> Self {
        Self {
            sim,
            baselines: baselines(),
            friction,
            starting_equity: STARTING_EQUITY,
            max_steps,
            max_reject_rate: 0.2,
        }
    }

    pub fn with_baselines(mut self, baselines: Vec<Candidate>) -> Self {
        self.baselines = baselines;
        self
    }

    pub fn with_starting_equity(mut self, equity: f64) -> Self {
        self.starting_equity = equity;
        self
    }

    pub fn with_max_reject_rate(mut self, rate: f64) -> Self {
        self.max_reject_rate = rate;
        self
    }

    fn simulate(&mut self, c: &Candidate, segment: &[Quote], seed: u64, is_baseline: bool) -> TournamentEntry {
        let setup = SimSetup {
            strategy: StrategySpec::from_candidate(c),
            overrides: RiskOverrides::default(),
            friction: self.friction,
            seed: seed ^ fnv1a(&c.id),
            starting_equity: self.starting_equity,
        };
        let metrics = replay(&mut self.sim, &setup, segment, self.max_steps);

        let mut safety_failures = Vec::new();
        if metrics.max_drawdown_pct > c.guards.max_drawdown_pct {
            safety_failures.push(format!("guard_drawdown>{:.2}%", c.guards.max_drawdown_pct));
        }
        if metrics.turnover > c.guards.max_turnover {
            safety_failures.push(format!("guard_turnover>{}", c.guards.max_turnover));
        }
        if metrics.reject_rate > self.max_reject_rate {
            safety_failures.push(format!("guard_reject_rate>{:.2}", self.max_reject_rate));
        }

        TournamentEntry {
            id: c.id.clone(),
            family: c.family.as_str().to_string(),
            is_baseline,
            score: metrics.score(),
            safety_pass: safety_failures.is_empty(),
            safety_failures,
            metrics,
        }
    }
}

impl<S: StepSimulator> TournamentRunner for SimTournament<S> {
    fn run(&mut self, segment: &[Quote], candidates: &[Candidate], seed: u64) -> Result<TournamentResult> {
        if segment.is_empty() {
            bail!("tournament segment is empty");
        }
        let mut entries = Vec::with_capacity(candidates.len() + self.baselines.len());
        for c in candidates {
            entries.push(self.simulate(c, segment, seed, false));
        }
        let baselines = self.baselines.clone();
        for b in &baselines {
            entries.push(self.simulate(b, segment, seed, true));
        }
        for e in &entries {
            log(
                Level::Debug,
                Domain::Tournament,
                "entry",
                obj(&[
                    ("candidate_id", v_str(&e.id)),
                    ("baseline", serde_json::json!(e.is_baseline)),
                    ("score", v_num(e.score)),
                    ("safety_pass", serde_json::json!(e.safety_pass)),
                ]),
            );
        }
        Ok(TournamentResult { entries })
    }

    fn baseline_ids(&self) -> Vec<String> {
        self.baselines.iter().map(|b| b.id.clone()).collect()
    }
}

/// Stable per-id seed salt.
fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}
