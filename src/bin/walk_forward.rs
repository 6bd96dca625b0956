//! Walk-forward evaluation over a seeded synthetic series.
//!
//! Usage: cargo run --bin walk_forward -- [--tiny] [--windows N] [--train-size N]
//!        [--eval-size N] [--seed N] [--max-steps N] [--candidate-count N]
//!        [--min-pass-rate F] [--min-baseline-beats N] [--min-windows N]
//!        [--runs-root DIR] [--run-id ID] [--no-mirror]
//!
//! Exit: 0 PASS, 1 FAIL, 2 INSUFFICIENT_DATA or error.

use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;

use policygate::artifacts::new_run_id;
use policygate::audit::{audit_no_lookahead, write_audit, NO_LOOKAHEAD_FILE};
use policygate::candidate::candidate_pool;
use policygate::cli::{exit, Args, EXIT_ERROR, EXIT_FAIL, EXIT_PASS};
use policygate::config::{PipelineConfig, WalkForwardConfig};
use policygate::logging::{log, obj, summary_line, v_str, Domain, Level};
use policygate::tournament::SimTournament;
use policygate::walk_forward::{self, WalkForwardStatus};

const TOOL: &str = "walk_forward";

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
    if args.has("--no-mirror") {
        pipeline.mirror_latest = false;
    }

    let mut cfg = WalkForwardConfig::from_env();
    if args.has("--tiny") {
        cfg = cfg.tiny();
    }
    cfg.windows = args.parse("--windows", cfg.windows)?;
    cfg.train_size = args.parse("--train-size", cfg.train_size)?;
    cfg.eval_size = args.parse("--eval-size", cfg.eval_size)?;
    cfg.seed = args.parse("--seed", cfg.seed)?;
    cfg.max_steps = args.parse("--max-steps", cfg.max_steps)?;
    cfg.candidate_count = args.parse("--candidate-count", cfg.candidate_count)?;
    cfg.min_pass_rate = args.parse("--min-pass-rate", cfg.min_pass_rate)?;
    cfg.min_baseline_beats = args.parse("--min-baseline-beats", cfg.min_baseline_beats)?;
    cfg.min_windows_required = args.parse("--min-windows", cfg.min_windows_required)?;

    let run_id = args
        .value("--run-id")
        .map(str::to_string)
        .unwrap_or_else(|| new_run_id("wf"));

    let mut runner = SimTournament::guarded(cfg.friction, cfg.max_steps)
        .with_starting_equity(cfg.starting_equity)
        .with_max_reject_rate(cfg.thresholds.max_reject_rate);
    let run = walk_forward::evaluate(&cfg, &mut runner, &candidate_pool(), &run_id, Utc::now())?;
    let written = walk_forward::write_artifacts(&run, &pipeline)?;

    let audit = audit_no_lookahead(&run.windows, &run_id, &run_id, Utc::now());
    let audit_path = write_audit(&audit, NO_LOOKAHEAD_FILE, &run_id, &pipeline)?;

    let s = &run.summary;
    println!(
        "{}",
        summary_line(
            TOOL,
            &[
                ("status", s.status.as_str().to_string()),
                ("run_id", s.run_id.clone()),
                ("windows", s.window_count.to_string()),
                ("pass_count", s.pass_count.to_string()),
                ("pass_rate", format!("{:.4}", s.pass_rate)),
                ("no_lookahead", audit.status.clone()),
                ("result", written.result_path.display().to_string()),
                ("audit", audit_path.display().to_string()),
            ],
        )
    );

    Ok(match s.status {
        WalkForwardStatus::Pass => EXIT_PASS,
        WalkForwardStatus::Fail => EXIT_FAIL,
        WalkForwardStatus::InsufficientData => EXIT_ERROR,
    })
}
