use std::fs;

use chrono::Utc;
use policygate::artifacts::{latest_path, load_evidence, sha256_hex, Evidence};
use policygate::config::{PipelineConfig, StressConfig};
use policygate::gate::{check_stress, StageStatus, StressEvidence};
use policygate::registry::{PolicySource, RegistryStore};
use policygate::sim::{GuardedSimulator, StrategySpec};
use policygate::stress::{self, StressInput, StressReport};
use policygate::synthetic;
use serde_json::json;
use tempfile::TempDir;

#[test]
fn registry_policy_report_round_trips_through_gate_view() {
    let dir = TempDir::new().unwrap();
    let pipeline = PipelineConfig::rooted_at(dir.path());
    let store = RegistryStore::from_config(&pipeline);
    store
        .upsert_policy(
            "guarded-v1",
            vec![("max_drawdown", json!(4.0)), ("cooldown_seconds", json!(120))],
            Some("baseline"),
            PolicySource::Manual,
            None,
        )
        .unwrap();
    let policy = store.get_policy(Some("guarded-v1")).unwrap();

    let cfg = StressConfig {
        series_len: 300,
        ..Default::default()
    };
    let quotes = synthetic::generate(cfg.series_len, cfg.seed);
    let input = StressInput {
        run_id: "stress-it-1",
        policy_version: &policy.version,
        overrides: &policy.risk_overrides,
        strategy: StrategySpec::default(),
        quotes: &quotes,
        quotes_source: "synthetic".to_string(),
        now: Utc::now(),
    };
    let mut report = stress::run_stress(&cfg, &input, &mut GuardedSimulator::new());
    let written = stress::write_artifacts(&mut report, &pipeline).unwrap();

    let on_disk: StressReport = serde_json::from_str(&fs::read_to_string(&written.report_path).unwrap()).unwrap();
    assert_eq!(on_disk.run_id, report.run_id);
    assert_eq!(on_disk.overall_pass, report.overall_pass);
    assert_eq!(on_disk.scenarios.len(), 4);
    assert_eq!(on_disk.policy_version, "guarded-v1");
    let scenario_bytes = fs::read(&written.scenarios_path).unwrap();
    assert_eq!(on_disk.evidence["scenarios_sha256"], sha256_hex(&scenario_bytes));
    assert_eq!(String::from_utf8(scenario_bytes).unwrap().lines().count(), 4);

    let mirror = latest_path(&pipeline.runs_root, stress::TOOL, stress::REPORT_FILE);
    let view: Evidence<StressEvidence> = load_evidence(Some(mirror.as_path()));
    let stage = check_stress(&view);
    let expected = if report.overall_pass { StageStatus::Pass } else { StageStatus::Fail };
    assert_eq!(stage.status, expected);
    assert_eq!(stage.run_id.as_deref(), Some("stress-it-1"));
}
