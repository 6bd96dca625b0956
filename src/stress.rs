//! Stress harness: replay one policy under four friction scenarios.
//!
//! | Scenario | Friction change                                   |
//! |----------|---------------------------------------------------|
//! | BASELINE | none                                              |
//! | STRESS_A | fees x2                                           |
//! | STRESS_B | slippage x3, spread x2                            |
//! | STRESS_C | latency x2, partial-fill floor 0.35, fill cap 0.6 |
//!
//! STRESS_C runs on its own seed (`seed + 303`) so its partial-fill draws are
//! independent of the other scenarios.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{mirror_latest, run_dir, write_json_atomic, write_jsonl_atomic, ArtifactRecord};
use crate::config::{PipelineConfig, StressConfig};
use crate::friction::FrictionMultipliers;
use crate::logging::{log, log_scenario, obj, v_str, Domain, Level, ProfileScope};
use crate::metrics::RunMetrics;
use crate::registry::RiskOverrides;
use crate::safety;
use crate::series::Quote;
use crate::sim::{replay, SimSetup, StepSimulator, StrategySpec};

pub const SCHEMA_VERSION: &str = "stress_report.v1";
pub const TOOL: &str = "stress";
pub const REPORT_FILE: &str = "stress_report.json";
pub const SCENARIOS_FILE: &str = "stress_scenarios.jsonl";
pub const SCENARIO_C_SEED_OFFSET: u64 = 303;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scenario {
    Baseline,
    StressA,
    StressB,
    StressC,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [Scenario::Baseline, Scenario::StressA, Scenario::StressB, Scenario::StressC];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Baseline => "BASELINE",
            Scenario::StressA => "STRESS_A",
            Scenario::StressB => "STRESS_B",
            Scenario::StressC => "STRESS_C",
        }
    }

    pub fn multipliers(&self) -> FrictionMultipliers {
        let base = FrictionMultipliers::default();
        match self {
            Scenario::Baseline => base,
            Scenario::StressA => FrictionMultipliers { fee: 2.0, ..base },
            Scenario::StressB => FrictionMultipliers {
                slippage: 3.0,
                spread: 2.0,
                ..base
            },
            Scenario::StressC => FrictionMultipliers {
                latency: 2.0,
                partial_fill_floor: Some(0.35),
                max_fill_cap: Some(0.6),
                ..base
            },
        }
    }

    /// Scenario-specific seed, if the scenario has one.
    pub fn seed(&self, base: u64) -> Option<u64> {
        match self {
            Scenario::StressC => Some(base.wrapping_add(SCENARIO_C_SEED_OFFSET)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenarioResult {
    pub scenario: Scenario,
    pub friction_multipliers: BTreeMap<String, f64>,
    pub metrics: RunMetrics,
    pub pass: bool,
    pub failures: Vec<String>,
    pub scenario_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub schema_version: String,
    pub ts_utc: String,
    pub ts_epoch_ms: i64,
    pub run_id: String,
    pub policy_version: String,
    pub seed: u64,
    pub max_steps: usize,
    pub series_len: usize,
    /// `PASS` or `FAIL`
    pub status: String,
    pub baseline_pass: bool,
    pub stress_pass: bool,
    pub overall_pass: bool,
    pub scenarios: Vec<StressScenarioResult>,
    /// `<SCENARIO>:<failure code>` for every failed check
    pub fail_reasons: Vec<String>,
    pub evidence: BTreeMap<String, String>,
}

/// What to stress: a policy, the strategy it governs, and the quotes to replay.
#[derive(Debug, Clone)]
pub struct StressInput<'a> {
    pub run_id: &'a str,
    pub policy_version: &'a str,
    pub overrides: &'a RiskOverrides,
    pub strategy: StrategySpec,
    pub quotes: &'a [Quote],
    /// Description of where the quotes came from, kept as evidence
    pub quotes_source: String,
    pub now: DateTime<Utc>,
}

/// `(baseline_pass, stress_pass)`; a missing BASELINE row counts as a failure.
pub fn pass_flags(results: &[StressScenarioResult]) -> (bool, bool) {
    let baseline_pass = results
        .iter()
        .find(|r| r.scenario == Scenario::Baseline)
        .map_or(false, |r| r.pass);
    let stress_pass = results
        .iter()
        .filter(|r| r.scenario != Scenario::Baseline)
        .all(|r| r.pass);
    (baseline_pass, stress_pass)
}

pub fn run_scenario(
    cfg: &StressConfig,
    input: &StressInput<'_>,
    sim: &mut dyn StepSimulator,
    scenario: Scenario,
) -> StressScenarioResult {
    let multipliers = scenario.multipliers();
    let scenario_seed = scenario.seed(cfg.seed);
    let setup = SimSetup {
        strategy: input.strategy,
        overrides: input.overrides.clone(),
        friction: cfg.friction.scaled(&multipliers),
        seed: scenario_seed.unwrap_or(cfg.seed),
        starting_equity: cfg.starting_equity,
    };
    let metrics = replay(sim, &setup, input.quotes, cfg.max_steps);
    let verdict = safety::evaluate(&metrics.safety_inputs(), &cfg.thresholds);
    log_scenario(
        scenario.as_str(),
        verdict.pass,
        metrics.max_drawdown_pct,
        metrics.turnover,
        metrics.reject_rate,
    );
    StressScenarioResult {
        scenario,
        friction_multipliers: multipliers.to_map(),
        metrics,
        pass: verdict.pass,
        failures: verdict.failures,
        scenario_seed,
    }
}

pub fn run_stress(cfg: &StressConfig, input: &StressInput<'_>, sim: &mut dyn StepSimulator) -> StressReport {
    let _profile = ProfileScope::with_context("stress", &[("policy_version", v_str(input.policy_version))]);
    let scenarios: Vec<_> = Scenario::ALL
        .iter()
        .map(|s| run_scenario(cfg, input, &mut *sim, *s))
        .collect();

    let (baseline_pass, stress_pass) = pass_flags(&scenarios);
    let overall_pass = baseline_pass && stress_pass;
    let fail_reasons: Vec<String> = scenarios
        .iter()
        .flat_map(|r| r.failures.iter().map(move |f| format!("{}:{}", r.scenario.as_str(), f)))
        .collect();

    let mut evidence = BTreeMap::new();
    evidence.insert("quotes_source".to_string(), input.quotes_source.clone());

    let status = if overall_pass { "PASS" } else { "FAIL" };
    log(
        Level::Info,
        Domain::Stress,
        "summary",
        obj(&[
            ("policy_version", v_str(input.policy_version)),
            ("status", v_str(status)),
            ("fail_reasons", serde_json::json!(fail_reasons)),
        ]),
    );

    StressReport {
        schema_version: SCHEMA_VERSION.to_string(),
        ts_utc: input.now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ts_epoch_ms: input.now.timestamp_millis(),
        run_id: input.run_id.to_string(),
        policy_version: input.policy_version.to_string(),
        seed: cfg.seed,
        max_steps: cfg.max_steps,
        series_len: input.quotes.len(),
        status: status.to_string(),
        baseline_pass,
        stress_pass,
        overall_pass,
        scenarios,
        fail_reasons,
        evidence,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StressArtifacts {
    pub report_path: PathBuf,
    pub scenarios_path: PathBuf,
    pub records: Vec<ArtifactRecord>,
}

/// Write the scenario log, then the report with the log's digest as evidence.
pub fn write_artifacts(report: &mut StressReport, pipeline: &PipelineConfig) -> Result<StressArtifacts> {
    let dir = run_dir(&pipeline.runs_root, TOOL, &report.run_id);
    let report_path = dir.join(REPORT_FILE);
    let scenarios_path = dir.join(SCENARIOS_FILE);

    let scenarios = write_jsonl_atomic(&scenarios_path, &report.scenarios)?;
    report
        .evidence
        .insert("scenarios_path".to_string(), scenarios.path.clone());
    report
        .evidence
        .insert("scenarios_sha256".to_string(), scenarios.sha256.clone());
    let main = write_json_atomic(&report_path, report)?;

    let mut records = vec![scenarios, main];
    if pipeline.mirror_latest {
        records.push(mirror_latest(&report_path, &pipeline.runs_root, TOOL)?);
        records.push(mirror_latest(&scenarios_path, &pipeline.runs_root, TOOL)?);
    }
    Ok(StressArtifacts {
        report_path,
        scenarios_path,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::STARTING_EQUITY;
    use crate::sim::{GuardedSimulator, StepOutcome};
    use crate::synthetic;

    /// One trade on the first bar, a 1% dip on the second, flat after.
    struct ScriptedSim {
        i: usize,
        reject_when_capped: bool,
        capped: bool,
    }

    impl ScriptedSim {
        fn calm() -> Self {
            Self {
                i: 0,
                reject_when_capped: false,
                capped: false,
            }
        }
    }

    impl StepSimulator for ScriptedSim {
        fn reset(&mut self, setup: &SimSetup) {
            self.i = 0;
            self.capped = setup.friction.max_fill_fraction < 1.0;
        }

        fn step(&mut self, _quote: &Quote) -> StepOutcome {
            let i = self.i;
            self.i += 1;
            let rejects = if self.reject_when_capped && self.capped && i < 3 { 1 } else { 0 };
            match i {
                0 => StepOutcome {
                    equity: STARTING_EQUITY,
                    trades: 1,
                    rejects,
                },
                1 => StepOutcome {
                    equity: STARTING_EQUITY * 0.99,
                    trades: 0,
                    rejects,
                },
                _ => StepOutcome {
                    equity: STARTING_EQUITY * 0.995,
                    trades: 0,
                    rejects,
                },
            }
        }
    }

    fn input<'a>(quotes: &'a [Quote], overrides: &'a RiskOverrides) -> StressInput<'a> {
        StressInput {
            run_id: "stress-test",
            policy_version: "baseline",
            overrides,
            strategy: StrategySpec::default(),
            quotes,
            quotes_source: "synthetic".to_string(),
            now: Utc::now(),
        }
    }

    #[test]
    fn test_calm_policy_passes_every_scenario_seed_101() {
        let cfg = StressConfig::default();
        let quotes = synthetic::generate(cfg.series_len, cfg.seed);
        let overrides = RiskOverrides::default();
        let report = run_stress(&cfg, &input(&quotes, &overrides), &mut ScriptedSim::calm());
        for s in &report.scenarios {
            assert!((s.metrics.max_drawdown_pct - 1.0).abs() < 1e-9);
            assert_eq!(s.metrics.turnover, 1);
            assert_eq!(s.metrics.reject_rate, 0.0);
        }
        assert!(report.overall_pass);
        assert!(report.baseline_pass && report.stress_pass);
        assert!(report.fail_reasons.is_empty());
        assert_eq!(report.status, "PASS");
    }

    #[test]
    fn test_single_stress_failure_fails_overall() {
        let cfg = StressConfig::default();
        let quotes = synthetic::generate(100, cfg.seed);
        let overrides = RiskOverrides::default();
        let mut sim = ScriptedSim {
            reject_when_capped: true,
            ..ScriptedSim::calm()
        };
        let report = run_stress(&cfg, &input(&quotes, &overrides), &mut sim);
        assert!(report.baseline_pass);
        assert!(!report.stress_pass);
        assert!(!report.overall_pass);
        assert_eq!(report.status, "FAIL");
        assert_eq!(report.fail_reasons, vec!["STRESS_C:reject_rate>0.20".to_string()]);
    }

    #[test]
    fn test_pass_flags_rule() {
        let row = |scenario, pass| StressScenarioResult {
            scenario,
            friction_multipliers: BTreeMap::new(),
            metrics: RunMetrics::default(),
            pass,
            failures: Vec::new(),
            scenario_seed: None,
        };
        for mask in 0u8..16 {
            let rows: Vec<_> = Scenario::ALL
                .iter()
                .enumerate()
                .map(|(k, s)| row(*s, mask & (1 << k) != 0))
                .collect();
            let (b, s) = pass_flags(&rows);
            assert_eq!(b && s, mask == 0b1111, "mask {:04b}", mask);
        }
        assert_eq!(pass_flags(&[]), (false, true));
    }

    #[test]
    fn test_scenario_seeds_and_multipliers() {
        assert_eq!(Scenario::Baseline.seed(101), None);
        assert_eq!(Scenario::StressB.seed(101), None);
        assert_eq!(Scenario::StressC.seed(101), Some(404));
        assert_eq!(Scenario::StressA.multipliers().fee, 2.0);
        assert_eq!(
            serde_json::to_string(&Scenario::StressC).unwrap(),
            "\"STRESS_C\""
        );
    }

    #[test]
    fn test_guarded_sim_report_shape() {
        let cfg = StressConfig::default();
        let quotes = synthetic::generate(cfg.series_len, cfg.seed);
        let overrides = RiskOverrides::default();
        let report = run_stress(&cfg, &input(&quotes, &overrides), &mut GuardedSimulator::new());
        let names: Vec<_> = report.scenarios.iter().map(|s| s.scenario.as_str()).collect();
        assert_eq!(names, vec!["BASELINE", "STRESS_A", "STRESS_B", "STRESS_C"]);
        assert_eq!(report.scenarios[3].scenario_seed, Some(cfg.seed + 303));
        assert_eq!(report.overall_pass, report.baseline_pass && report.stress_pass);
    }
}
