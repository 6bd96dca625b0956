//! Stress a registered policy under the four friction scenarios.
//!
//! Usage: cargo run --bin stress_harness -- [--policy-version V] [--quotes FILE.csv]
//!        [--seed N] [--max-steps N] [--length N] [--registry FILE]
//!        [--runs-root DIR] [--run-id ID] [--no-mirror]
//!
//! Without `--quotes` a synthetic series of `--length` bars is generated from
//! the seed. Exit: 0 PASS, 1 FAIL, 2 error.

use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;

use policygate::artifacts::new_run_id;
use policygate::audit::{audit_trade_activity, write_audit, TRADE_ACTIVITY_FILE};
use policygate::cli::{exit, Args, EXIT_ERROR, EXIT_FAIL, EXIT_PASS};
use policygate::config::{PipelineConfig, StressConfig};
use policygate::logging::{log, obj, summary_line, v_str, Domain, Level};
use policygate::registry::RegistryStore;
use policygate::series::load_quotes_csv;
use policygate::sim::{GuardedSimulator, StrategySpec};
use policygate::stress::{self, StressInput};
use policygate::synthetic;

const TOOL: &str = "stress_harness";

fn main() -> ExitCode {
    let args = Args::from_env();
    match run(&args) {
        Ok(code) => exit(code),
        Err(err) => {
            log(
                Level::Error,
                Domain::System,
                "run_failed",
                obj(&[("tool", v_str(TOOL)), ("error", v_str(&format!("{:#}", err)))]),
            );
            println!(
                "{}",
                summary_line(TOOL, &[("status", "ERROR".to_string()), ("error", err.to_string())])
            );
            exit(EXIT_ERROR)
        }
    }
}

fn run(args: &Args) -> Result<u8> {
    let mut pipeline = PipelineConfig::from_env();
    if let Some(root) = args.path("--runs-root") {
        pipeline.runs_root = root;
    }
    if let Some(path) = args.path("--registry") {
        pipeline.registry_path = path;
    }
    if args.has("--no-mirror") {
        pipeline.mirror_latest = false;
    }

    let mut cfg = StressConfig::from_env();
    cfg.seed = args.parse("--seed", cfg.seed)?;
    cfg.max_steps = args.parse("--max-steps", cfg.max_steps)?;
    cfg.series_len = args.parse("--length", cfg.series_len)?;

    let store = RegistryStore::from_config(&pipeline);
    let policy = store.get_policy(args.value("--policy-version"))?;

    let (quotes, quotes_source) = match args.path("--quotes") {
        Some(path) => (load_quotes_csv(&path)?, path.display().to_string()),
        None => (
            synthetic::generate(cfg.series_len, cfg.seed),
            format!("synthetic:seed={}:len={}", cfg.seed, cfg.series_len),
        ),
    };

    let run_id = args
        .value("--run-id")
        .map(str::to_string)
        .unwrap_or_else(|| new_run_id("stress"));
    let now = Utc::now();
    let input = StressInput {
        run_id: &run_id,
        policy_version: &policy.version,
        overrides: &policy.risk_overrides,
        strategy: StrategySpec::default(),
        quotes: &quotes,
        quotes_source,
        now,
    };

    let mut report = stress::run_stress(&cfg, &input, &mut GuardedSimulator::new());
    report
        .evidence
        .insert("policy_registry".to_string(), pipeline.registry_path.display().to_string());
    let written = stress::write_artifacts(&mut report, &pipeline)?;

    let activity = audit_trade_activity(&report, 1, cfg.thresholds.max_reject_rate, &run_id, now);
    let activity_path = write_audit(&activity, TRADE_ACTIVITY_FILE, &run_id, &pipeline)?;

    println!(
        "{}",
        summary_line(
            TOOL,
            &[
                ("status", report.status.clone()),
                ("run_id", run_id.clone()),
                ("policy_version", report.policy_version.clone()),
                ("baseline_pass", report.baseline_pass.to_string()),
                ("stress_pass", report.stress_pass.to_string()),
                ("fail_reasons", report.fail_reasons.join(",")),
                ("trade_activity", activity.status.clone()),
                ("report", written.report_path.display().to_string()),
                ("trade_activity_report", activity_path.display().to_string()),
            ],
        )
    );

    Ok(if report.overall_pass { EXIT_PASS } else { EXIT_FAIL })
}
