//! Environment-driven configuration for every pipeline stage.
//!
//! Each struct has a `Default` and a `from_env()`; the binaries then apply
//! their command-line flags on top. Nothing here is process-global: each
//! component receives the struct it needs.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::friction::FrictionPolicy;
use crate::metrics::STARTING_EQUITY;
use crate::safety::SafetyThresholds;

pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Filesystem layout shared by every tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub runs_root: PathBuf,
    pub registry_path: PathBuf,
    pub registry_seed_path: PathBuf,
    /// Evidence paths under this root are stored repo-relative
    pub repo_root: PathBuf,
    /// Mirror primary artifacts into `<tool>_latest/`
    pub mirror_latest: bool,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let repo_root = std::env::var("REPO_ROOT")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            runs_root: std::env::var("RUNS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("out/runs")),
            registry_path: std::env::var("REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("state/policy_registry.json")),
            registry_seed_path: std::env::var("REGISTRY_SEED_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("state/policy_registry.seed.json")),
            repo_root,
            mirror_latest: env_flag("ARTIFACT_MIRROR", true),
        }
    }

    /// Layout with everything under one directory (tests, sandboxes).
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            runs_root: dir.join("runs"),
            registry_path: dir.join("state").join("policy_registry.json"),
            registry_seed_path: dir.join("state").join("policy_registry.seed.json"),
            repo_root: dir.to_path_buf(),
            mirror_latest: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub windows: usize,
    pub train_size: usize,
    pub eval_size: usize,
    pub seed: u64,
    /// Cap on simulated steps per tournament run
    pub max_steps: usize,
    pub candidate_count: usize,
    pub min_pass_rate: f64,
    pub min_baseline_beats: usize,
    pub min_windows_required: usize,
    pub thresholds: SafetyThresholds,
    pub friction: FrictionPolicy,
    pub starting_equity: f64,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            windows: 6,
            train_size: 240,
            eval_size: 120,
            seed: 101,
            max_steps: 5000,
            candidate_count: 4,
            min_pass_rate: 0.6,
            min_baseline_beats: 2,
            min_windows_required: 3,
            thresholds: SafetyThresholds::default(),
            friction: FrictionPolicy::default(),
            starting_equity: STARTING_EQUITY,
        }
    }
}

impl WalkForwardConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            windows: env_parse("WF_WINDOWS", d.windows),
            train_size: env_parse("WF_TRAIN_SIZE", d.train_size),
            eval_size: env_parse("WF_EVAL_SIZE", d.eval_size),
            seed: env_parse("WF_SEED", d.seed),
            max_steps: env_parse("WF_MAX_STEPS", d.max_steps),
            candidate_count: env_parse("WF_CANDIDATE_COUNT", d.candidate_count),
            min_pass_rate: env_parse("WF_MIN_PASS_RATE", d.min_pass_rate),
            min_baseline_beats: env_parse("WF_MIN_BASELINE_BEATS", d.min_baseline_beats),
            min_windows_required: env_parse("WF_MIN_WINDOWS", d.min_windows_required),
            thresholds: SafetyThresholds::from_env(),
            friction: FrictionPolicy::from_env(),
            starting_equity: d.starting_equity,
        }
    }

    /// Fast preset for smoke runs and CI.
    pub fn tiny(mut self) -> Self {
        self.windows = 3;
        self.train_size = 60;
        self.eval_size = 30;
        self.max_steps = 500;
        self.candidate_count = 2;
        self
    }

    pub fn series_len(&self) -> usize {
        self.windows * (self.train_size + self.eval_size)
    }

    /// Number of passing windows implied by `min_pass_rate`.
    pub fn window_passes_required(&self) -> usize {
        (self.min_pass_rate * self.windows as f64).ceil().max(0.0) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressConfig {
    pub seed: u64,
    pub max_steps: usize,
    /// Length of the synthetic series when no recorded quotes are given
    pub series_len: usize,
    pub starting_equity: f64,
    pub thresholds: SafetyThresholds,
    pub friction: FrictionPolicy,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            seed: 101,
            max_steps: 5000,
            series_len: 720,
            starting_equity: STARTING_EQUITY,
            thresholds: SafetyThresholds::default(),
            friction: FrictionPolicy::default(),
        }
    }
}

impl StressConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            seed: env_parse("STRESS_SEED", d.seed),
            max_steps: env_parse("STRESS_MAX_STEPS", d.max_steps),
            series_len: env_parse("STRESS_SERIES_LEN", d.series_len),
            starting_equity: d.starting_equity,
            thresholds: SafetyThresholds::from_env(),
            friction: FrictionPolicy::from_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Size of the rolling decision window, current decision included
    pub window_count: usize,
    pub window_passes_required: usize,
    pub auto_promote_consecutive: usize,
    pub require_walk_forward: bool,
    pub require_no_lookahead: bool,
    pub require_trade_activity: bool,
    pub thresholds: SafetyThresholds,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            window_count: 5,
            window_passes_required: 3,
            auto_promote_consecutive: 3,
            require_walk_forward: true,
            require_no_lookahead: false,
            require_trade_activity: false,
            thresholds: SafetyThresholds::default(),
        }
    }
}

impl GateConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            window_count: env_parse("GATE_WINDOW_COUNT", d.window_count),
            window_passes_required: env_parse("GATE_WINDOW_PASSES_REQUIRED", d.window_passes_required),
            auto_promote_consecutive: env_parse("GATE_AUTO_PROMOTE_CONSECUTIVE", d.auto_promote_consecutive),
            require_walk_forward: env_flag("GATE_REQUIRE_WALK_FORWARD", d.require_walk_forward),
            require_no_lookahead: env_flag("GATE_REQUIRE_NO_LOOKAHEAD", d.require_no_lookahead),
            require_trade_activity: env_flag("GATE_REQUIRE_TRADE_ACTIVITY", d.require_trade_activity),
            thresholds: SafetyThresholds::from_env(),
        }
    }
}
