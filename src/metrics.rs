use serde::{Deserialize, Serialize};

use crate::safety::SafetyInputs;
use crate::sim::StepOutcome;

/// Fixed starting balance every simulation begins from.
pub const STARTING_EQUITY: f64 = 10_000.0;

const DRAWDOWN_PENALTY: f64 = 25.0;
const TURNOVER_PENALTY: f64 = 0.5;
const REJECT_PENALTY: f64 = 2.0;

/// Linear score used whenever a run carries no explicit score.
pub fn fallback_score(final_equity: f64, drawdown_pct: f64, turnover: u64, reject_count: u64) -> f64 {
    final_equity
        - DRAWDOWN_PENALTY * drawdown_pct
        - TURNOVER_PENALTY * turnover as f64
        - REJECT_PENALTY * reject_count as f64
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub final_equity: f64,
    pub return_pct: f64,
    pub max_drawdown_pct: f64,
    /// Number of fills
    pub turnover: u64,
    pub reject_count: u64,
    pub reject_rate: f64,
    pub steps: u64,
}

impl RunMetrics {
    pub fn score(&self) -> f64 {
        fallback_score(self.final_equity, self.max_drawdown_pct, self.turnover, self.reject_count)
    }

    pub fn safety_inputs(&self) -> SafetyInputs {
        SafetyInputs {
            drawdown_pct: self.max_drawdown_pct,
            turnover: self.turnover,
            reject_rate: self.reject_rate,
        }
    }
}

/// Running peak equity and the deepest drawdown seen from it, in percent.
#[derive(Debug, Clone, Copy)]
pub struct EquityTracker {
    peak: f64,
    max_drawdown_pct: f64,
}

impl EquityTracker {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            peak: starting_equity,
            max_drawdown_pct: 0.0,
        }
    }

    pub fn update(&mut self, equity: f64) {
        if equity > self.peak {
            self.peak = equity;
        }
        let drawdown = if self.peak > 0.0 {
            (self.peak - equity) / self.peak * 100.0
        } else {
            0.0
        };
        if drawdown > self.max_drawdown_pct {
            self.max_drawdown_pct = drawdown;
        }
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn max_drawdown_pct(&self) -> f64 {
        self.max_drawdown_pct
    }
}

/// Folds per-step simulator outcomes into `RunMetrics`.
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    starting_equity: f64,
    last_equity: f64,
    tracker: EquityTracker,
    trades: u64,
    rejects: u64,
    steps: u64,
}

impl MetricsAccumulator {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            starting_equity,
            last_equity: starting_equity,
            tracker: EquityTracker::new(starting_equity),
            trades: 0,
            rejects: 0,
            steps: 0,
        }
    }

    pub fn record(&mut self, outcome: &StepOutcome) {
        self.trades += outcome.trades as u64;
        self.rejects += outcome.rejects as u64;
        self.steps += 1;
        self.last_equity = outcome.equity;
        self.tracker.update(outcome.equity);
    }

    pub fn finish(&self) -> RunMetrics {
        let return_pct = if self.starting_equity > 0.0 {
            (self.last_equity - self.starting_equity) / self.starting_equity * 100.0
        } else {
            0.0
        };
        RunMetrics {
            final_equity: self.last_equity,
            return_pct,
            max_drawdown_pct: self.tracker.max_drawdown_pct(),
            turnover: self.trades,
            reject_count: self.rejects,
            reject_rate: self.rejects as f64 / self.trades.max(1) as f64,
            steps: self.steps,
        }
    }
}
