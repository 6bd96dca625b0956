//! Promotion gate: decide APPROVE / REJECT for one candidate.
//!
//! Usage: cargo run --bin promotion_gate -- --candidate FILE.json --baselines FILE.json
//!        [--stress-report FILE] [--walk-forward FILE] [--no-lookahead-audit FILE]
//!        [--trade-activity-report FILE] [--require-walk-forward | --no-require-walk-forward]
//!        [--require-no-lookahead] [--require-trade-activity]
//!        [--registry FILE] [--runs-root DIR] [--run-id ID] [--no-mirror]
//!
//! Evidence paths default to the `_latest` mirrors under the runs root.
//! Exit: 0 APPROVE, 1 REJECT, 2 error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;

use policygate::artifacts::{latest_path, load_evidence, new_run_id, Evidence};
use policygate::audit::{self, NO_LOOKAHEAD_FILE, TRADE_ACTIVITY_FILE};
use policygate::cli::{exit, Args, EXIT_ERROR, EXIT_FAIL, EXIT_PASS};
use policygate::config::{GateConfig, PipelineConfig};
use policygate::gate::{
    self, AuditEvidence, BaselineMetrics, CandidateMetrics, DecisionLog, GateInput, StressEvidence,
    WalkForwardEvidence,
};
use policygate::logging::{log, obj, summary_line, v_str, Domain, Level, ProfileScope};
use policygate::registry::RegistryStore;
use policygate::stress;
use policygate::walk_forward;

const TOOL: &str = "promotion_gate";

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

fn evidence_path(args: &Args, flag: &str, runs_root: &Path, tool: &str, file: &str) -> PathBuf {
    args.path(flag)
        .unwrap_or_else(|| latest_path(runs_root, tool, file))
}

fn warn_unusable<T>(what: &str, path: Option<&Path>, ev: &Evidence<T>) {
    if let Evidence::Invalid(reason) = ev {
        log(
            Level::Warn,
            Domain::Gate,
            "evidence_invalid",
            obj(&[
                ("evidence", v_str(what)),
                ("path", v_str(&path.map(|p| p.display().to_string()).unwrap_or_default())),
                ("reason", v_str(reason)),
            ]),
        );
    }
}

fn run(args: &Args) -> Result<u8> {
    let _profile = ProfileScope::new("promotion_gate");
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

    let mut cfg = GateConfig::from_env();
    cfg.require_walk_forward = args.switch("--require-walk-forward", cfg.require_walk_forward);
    cfg.require_no_lookahead = args.switch("--require-no-lookahead", cfg.require_no_lookahead);
    cfg.require_trade_activity = args.switch("--require-trade-activity", cfg.require_trade_activity);

    let root = pipeline.runs_root.clone();
    let candidate_path = args.path("--candidate");
    let baselines_path = args.path("--baselines");
    let stress_path = evidence_path(args, "--stress-report", &root, stress::TOOL, stress::REPORT_FILE);
    let wf_path = evidence_path(args, "--walk-forward", &root, walk_forward::TOOL, walk_forward::RESULT_FILE);
    let nl_path = evidence_path(args, "--no-lookahead-audit", &root, audit::TOOL, NO_LOOKAHEAD_FILE);
    let ta_path = evidence_path(args, "--trade-activity-report", &root, audit::TOOL, TRADE_ACTIVITY_FILE);

    let candidate_ev: Evidence<CandidateMetrics> = load_evidence(candidate_path.as_deref());
    warn_unusable("candidate", candidate_path.as_deref(), &candidate_ev);
    let baselines_ev: Evidence<Vec<BaselineMetrics>> = load_evidence(baselines_path.as_deref());
    warn_unusable("baselines", baselines_path.as_deref(), &baselines_ev);
    let stress_ev: Evidence<StressEvidence> = load_evidence(Some(stress_path.as_path()));
    warn_unusable("stress_report", Some(stress_path.as_path()), &stress_ev);
    let wf_ev: Evidence<WalkForwardEvidence> = load_evidence(Some(wf_path.as_path()));
    warn_unusable("walk_forward", Some(wf_path.as_path()), &wf_ev);
    let nl_ev: Evidence<AuditEvidence> = load_evidence(Some(nl_path.as_path()));
    warn_unusable("no_lookahead_audit", Some(nl_path.as_path()), &nl_ev);
    let ta_ev: Evidence<AuditEvidence> = load_evidence(Some(ta_path.as_path()));
    warn_unusable("trade_activity_report", Some(ta_path.as_path()), &ta_ev);

    let candidate = candidate_ev.present();
    let baselines = baselines_ev.present().cloned().unwrap_or_default();
    let history = candidate
        .map(|c| DecisionLog::new(&root).history(&c.candidate_id))
        .unwrap_or_default();

    let mut evidence_paths = BTreeMap::new();
    for (key, path) in [
        ("candidate", candidate_path.as_deref()),
        ("baselines", baselines_path.as_deref()),
        ("stress_report", Some(stress_path.as_path())),
        ("walk_forward", Some(wf_path.as_path())),
        ("no_lookahead_audit", Some(nl_path.as_path())),
        ("trade_activity_report", Some(ta_path.as_path())),
    ] {
        if let Some(p) = path {
            evidence_paths.insert(key.to_string(), p.display().to_string());
        }
    }

    let run_id = args
        .value("--run-id")
        .map(str::to_string)
        .unwrap_or_else(|| new_run_id("gate"));
    let decision = gate::evaluate(
        &GateInput {
            candidate,
            baselines: &baselines,
            run_id: &run_id,
            stress: &stress_ev,
            walk_forward: &wf_ev,
            no_lookahead: &nl_ev,
            trade_activity: &ta_ev,
            history: &history,
            evidence_paths,
            now: Utc::now(),
        },
        &cfg,
    );

    let decision_path = gate::write_decision(&decision, &pipeline)?;
    let store = RegistryStore::from_config(&pipeline);
    let evidence = decision_path.display().to_string();
    let event = gate::apply_to_registry(&decision, candidate, &store, Some(&evidence))?;

    println!(
        "{}",
        summary_line(
            TOOL,
            &[
                ("decision", decision.decision.as_str().to_string()),
                ("candidate_id", decision.candidate_id.clone()),
                ("run_id", decision.run_id.clone()),
                ("reasons", decision.reasons.join(",")),
                ("window_passes", decision.window_passes.to_string()),
                ("window_required", decision.window_required.to_string()),
                ("auto_promote_eligible", decision.auto_promote_eligible.to_string()),
                (
                    "registry_action",
                    event.map(|e| e.action.as_str().to_string()).unwrap_or_else(|| "NONE".to_string()),
                ),
                ("decision_path", evidence),
            ],
        )
    );

    Ok(if decision.is_approved() { EXIT_PASS } else { EXIT_FAIL })
}
