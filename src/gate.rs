//! Promotion gate.
//!
//! `evaluate` folds every piece of evidence about a candidate into one
//! APPROVE/REJECT decision:
//!
//! 1. safety thresholds on the candidate's own metrics
//! 2. strictly beating every baseline score
//! 3. the stress report (always required)
//! 4. walk-forward, no-lookahead and trade-activity evidence, each only when
//!    the config requires it
//! 5. a rolling window over the candidate's prior decisions
//!
//! Required evidence that is missing or malformed is a rejection with a
//! specific reason code, never a silent pass. The function is pure: the
//! clock value and the decision history are inputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::{append_jsonl, mirror_latest, read_jsonl, run_dir, write_json_atomic, Evidence};
use crate::config::{GateConfig, PipelineConfig};
use crate::logging::log_decision;
use crate::metrics::fallback_score;
use crate::registry::{PolicySource, RegistryEvent, RegistryStore};
use crate::safety::{self, SafetyInputs};

pub const SCHEMA_VERSION: &str = "promotion_decision.v1";
pub const TOOL: &str = "promotion";
pub const DECISION_FILE: &str = "promotion_decision.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "APPROVE",
            Decision::Reject => "REJECT",
        }
    }
}

// =============================================================================
// Inputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetrics {
    pub candidate_id: String,
    /// Explicit score; the fallback formula is used when absent
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub final_equity: f64,
    #[serde(default, alias = "max_drawdown_pct")]
    pub drawdown_pct: f64,
    #[serde(default)]
    pub turnover: u64,
    #[serde(default)]
    pub reject_count: u64,
    #[serde(default)]
    pub reject_rate: f64,
    /// Proposed overrides; the registry applies its whitelist on write
    #[serde(default)]
    pub risk_overrides: BTreeMap<String, Value>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl CandidateMetrics {
    pub fn effective_score(&self) -> f64 {
        self.score
            .unwrap_or_else(|| fallback_score(self.final_equity, self.drawdown_pct, self.turnover, self.reject_count))
    }

    pub fn safety_inputs(&self) -> SafetyInputs {
        SafetyInputs {
            drawdown_pct: self.drawdown_pct,
            turnover: self.turnover,
            reject_rate: self.reject_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineMetrics {
    #[serde(alias = "id")]
    pub baseline_id: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub final_equity: f64,
    #[serde(default, alias = "max_drawdown_pct")]
    pub drawdown_pct: f64,
    #[serde(default)]
    pub turnover: u64,
    #[serde(default)]
    pub reject_count: u64,
}

impl BaselineMetrics {
    pub fn effective_score(&self) -> f64 {
        self.score
            .unwrap_or_else(|| fallback_score(self.final_equity, self.drawdown_pct, self.turnover, self.reject_count))
    }
}

/// The fields of a stress report the gate looks at. Everything is optional
/// so that partial or legacy reports still parse and fail field by field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StressEvidence {
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub baseline_pass: Option<bool>,
    pub stress_pass: Option<bool>,
    pub scenarios: Option<Vec<Value>>,
    pub fail_reasons: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardEvidence {
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub window_passes: Option<u64>,
    pub pass_count: Option<u64>,
    pub window_passes_required: Option<u64>,
}

/// Shape shared by the no-lookahead audit and the trade-activity report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditEvidence {
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub violations: Option<Vec<Value>>,
}

/// A past decision, as read back from the decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorDecision {
    pub candidate_id: String,
    pub decision: Decision,
    #[serde(default)]
    pub ts_epoch_ms: i64,
    #[serde(default)]
    pub ts_utc: String,
    #[serde(default)]
    pub run_id: String,
}

impl PriorDecision {
    fn order_key(&self) -> (i64, &str) {
        (self.ts_epoch_ms, self.run_id.as_str())
    }
}

pub struct GateInput<'a> {
    pub candidate: Option<&'a CandidateMetrics>,
    pub baselines: &'a [BaselineMetrics],
    pub run_id: &'a str,
    pub stress: &'a Evidence<StressEvidence>,
    pub walk_forward: &'a Evidence<WalkForwardEvidence>,
    pub no_lookahead: &'a Evidence<AuditEvidence>,
    pub trade_activity: &'a Evidence<AuditEvidence>,
    /// Prior decisions; entries for other candidates are ignored
    pub history: &'a [PriorDecision],
    /// Where each piece of evidence was read from, recorded verbatim
    pub evidence_paths: BTreeMap<String, String>,
    pub now: DateTime<Utc>,
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pass,
    Fail,
    Missing,
    Invalid,
    /// Present, but its own status field is absent or unrecognized
    Unknown,
    NotRequired,
    NotEvaluated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub status: StageStatus,
    pub required: bool,
    pub ok: bool,
    pub run_id: Option<String>,
    pub failures: Vec<String>,
}

impl StageReport {
    fn not_evaluated(required: bool) -> Self {
        Self {
            status: StageStatus::NotEvaluated,
            required,
            ok: false,
            run_id: None,
            failures: Vec::new(),
        }
    }

    fn not_required(run_id: Option<String>) -> Self {
        Self {
            status: StageStatus::NotRequired,
            required: false,
            ok: true,
            run_id,
            failures: Vec::new(),
        }
    }

    fn from_failures(status_field: Option<&str>, run_id: Option<String>, failures: Vec<String>) -> Self {
        let status = match status_field {
            Some("PASS") | Some("FAIL") if failures.is_empty() => StageStatus::Pass,
            Some("PASS") | Some("FAIL") => StageStatus::Fail,
            _ => StageStatus::Unknown,
        };
        Self {
            ok: failures.is_empty(),
            status,
            required: true,
            run_id,
            failures,
        }
    }

    fn absent(status: StageStatus, code: String) -> Self {
        Self {
            status,
            required: true,
            ok: false,
            run_id: None,
            failures: vec![code],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub schema_version: String,
    pub ts_utc: String,
    pub ts_epoch_ms: i64,
    pub run_id: String,
    pub candidate_id: String,
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub required_next_steps: Vec<String>,
    pub evidence_run_ids: BTreeMap<String, String>,
    pub evidence_paths: BTreeMap<String, String>,
    pub baseline_scores: BTreeMap<String, f64>,
    pub candidate_score: Option<f64>,
    pub safety_pass: bool,
    pub safety_failures: Vec<String>,
    pub beat_baselines: bool,
    pub current_pass: bool,
    pub prior_window_passes: usize,
    /// Prior passes plus this run's
    pub window_passes: usize,
    pub window_required: usize,
    pub window_count: usize,
    pub consecutive_approvals: usize,
    pub auto_promote_eligible: bool,
    pub auto_promote_required_consecutive: usize,
    pub stress: StageReport,
    pub walk_forward: StageReport,
    pub no_lookahead: StageReport,
    pub trade_activity: StageReport,
}

impl PromotionDecision {
    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approve
    }
}

/// Ordered list without duplicates.
#[derive(Debug, Default)]
struct Codes(Vec<String>);

impl Codes {
    fn push(&mut self, code: impl Into<String>) {
        let code = code.into();
        if !self.0.contains(&code) {
            self.0.push(code);
        }
    }

    fn extend<I: IntoIterator<Item = String>>(&mut self, codes: I) {
        for c in codes {
            self.push(c);
        }
    }
}

// =============================================================================
// Stage checks
// =============================================================================

/// `PASS` is fine; anything else becomes `<prefix>_status_<...>`.
fn check_status(prefix: &str, status: Option<&str>, failures: &mut Vec<String>) {
    match status {
        None => failures.push(format!("{}_status_missing", prefix)),
        Some("PASS") => {}
        Some("FAIL") => failures.push(format!("{}_status_fail", prefix)),
        Some(_) => failures.push(format!("{}_status_invalid", prefix)),
    }
}

pub fn check_stress(ev: &Evidence<StressEvidence>) -> StageReport {
    let r = match ev {
        Evidence::Missing => return StageReport::absent(StageStatus::Missing, "stress_report_missing".into()),
        Evidence::Invalid(_) => return StageReport::absent(StageStatus::Invalid, "stress_report_invalid".into()),
        Evidence::Present(r) => r,
    };
    let mut failures = Vec::new();
    if r.scenarios.as_ref().map_or(true, |s| s.is_empty()) {
        failures.push("stress_scenarios_missing".to_string());
    }
    match r.baseline_pass {
        None => failures.push("stress_baseline_pass_missing".to_string()),
        Some(false) => failures.push("stress_baseline_failed".to_string()),
        Some(true) => {}
    }
    match r.stress_pass {
        None => failures.push("stress_pass_missing".to_string()),
        Some(false) => failures.push("stress_scenarios_failed".to_string()),
        Some(true) => {}
    }
    check_status("stress", r.status.as_deref(), &mut failures);
    StageReport::from_failures(r.status.as_deref(), r.run_id.clone(), failures)
}

pub fn check_walk_forward(ev: &Evidence<WalkForwardEvidence>, required: bool) -> StageReport {
    if !required {
        return StageReport::not_required(ev.present().and_then(|r| r.run_id.clone()));
    }
    let r = match ev {
        Evidence::Missing => {
            return StageReport::absent(StageStatus::Missing, "walk_forward_result_missing".into())
        }
        Evidence::Invalid(_) => {
            return StageReport::absent(StageStatus::Invalid, "walk_forward_result_invalid".into())
        }
        Evidence::Present(r) => r,
    };
    let mut failures = Vec::new();
    match r.status.as_deref() {
        None => failures.push("walk_forward_status_missing".to_string()),
        Some("PASS") => {}
        Some("FAIL") => failures.push("walk_forward_status_fail".to_string()),
        Some("INSUFFICIENT_DATA") => failures.push("walk_forward_insufficient_data".to_string()),
        Some(_) => failures.push("walk_forward_status_invalid".to_string()),
    }
    let passes = r.window_passes.or(r.pass_count);
    if let (Some(passes), Some(needed)) = (passes, r.window_passes_required) {
        if passes < needed {
            failures.push("walk_forward_window_passes_below_required".to_string());
        }
    }
    let status_field = match r.status.as_deref() {
        Some("INSUFFICIENT_DATA") => Some("FAIL"),
        other => other,
    };
    StageReport::from_failures(status_field, r.run_id.clone(), failures)
}

/// No-lookahead audit and trade-activity report share one check; any
/// violation entry fails the stage whatever its status says.
pub fn check_audit(prefix: &str, missing_code: &str, ev: &Evidence<AuditEvidence>, required: bool) -> StageReport {
    if !required {
        return StageReport::not_required(ev.present().and_then(|r| r.run_id.clone()));
    }
    let r = match ev {
        Evidence::Missing => return StageReport::absent(StageStatus::Missing, format!("{}_missing", missing_code)),
        Evidence::Invalid(_) => return StageReport::absent(StageStatus::Invalid, format!("{}_invalid", missing_code)),
        Evidence::Present(r) => r,
    };
    let mut failures = Vec::new();
    check_status(prefix, r.status.as_deref(), &mut failures);
    if r.violations.as_ref().map_or(false, |v| !v.is_empty()) {
        failures.push(format!("{}_violations", prefix));
    }
    StageReport::from_failures(r.status.as_deref(), r.run_id.clone(), failures)
}

// =============================================================================
// Decision
// =============================================================================

pub fn evaluate(input: &GateInput<'_>, cfg: &GateConfig) -> PromotionDecision {
    let mut reasons = Codes::default();
    let mut next_steps = Codes::default();

    let mut decision = PromotionDecision {
        schema_version: SCHEMA_VERSION.to_string(),
        ts_utc: input.now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ts_epoch_ms: input.now.timestamp_millis(),
        run_id: input.run_id.to_string(),
        candidate_id: String::new(),
        decision: Decision::Reject,
        reasons: Vec::new(),
        required_next_steps: Vec::new(),
        evidence_run_ids: BTreeMap::new(),
        evidence_paths: input.evidence_paths.clone(),
        baseline_scores: input
            .baselines
            .iter()
            .map(|b| (b.baseline_id.clone(), b.effective_score()))
            .collect(),
        candidate_score: None,
        safety_pass: false,
        safety_failures: Vec::new(),
        beat_baselines: false,
        current_pass: false,
        prior_window_passes: 0,
        window_passes: 0,
        window_required: cfg.window_passes_required,
        window_count: cfg.window_count,
        consecutive_approvals: 0,
        auto_promote_eligible: false,
        auto_promote_required_consecutive: cfg.auto_promote_consecutive,
        stress: StageReport::not_evaluated(true),
        walk_forward: StageReport::not_evaluated(cfg.require_walk_forward),
        no_lookahead: StageReport::not_evaluated(cfg.require_no_lookahead),
        trade_activity: StageReport::not_evaluated(cfg.require_trade_activity),
    };

    let Some(candidate) = input.candidate else {
        decision.reasons = vec!["no_candidate_available".to_string()];
        decision.required_next_steps = vec!["provide_candidate_metrics".to_string()];
        log_decision("", decision.decision.as_str(), &decision.reasons, 0, cfg.window_passes_required, false);
        return decision;
    };
    decision.candidate_id = candidate.candidate_id.clone();
    if let Some(id) = &candidate.run_id {
        decision.evidence_run_ids.insert("candidate".to_string(), id.clone());
    }

    // Safety
    let verdict = safety::evaluate(&candidate.safety_inputs(), &cfg.thresholds);
    if !verdict.pass {
        reasons.extend(verdict.failures.iter().map(|f| format!("safety_violation:{}", f)));
        next_steps.push("reduce_risk_exposure");
    }

    // Baselines: strictly above every one of them
    let score = candidate.effective_score();
    let mut beat_baselines = !input.baselines.is_empty();
    if input.baselines.is_empty() {
        reasons.push("baselines_missing");
    }
    for b in input.baselines {
        if score <= b.effective_score() {
            beat_baselines = false;
            reasons.push(format!("baseline_not_beaten:{}", b.baseline_id));
        }
    }
    if !beat_baselines {
        next_steps.push("improve_strategy_edge");
    }

    // Rolling window over this candidate's history
    let mut history: Vec<&PriorDecision> = input
        .history
        .iter()
        .filter(|d| d.candidate_id == candidate.candidate_id)
        .collect();
    history.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    let prior_window = cfg.window_count.saturating_sub(1);
    let recent = &history[history.len().saturating_sub(prior_window)..];
    let prior_passes = recent.iter().filter(|d| d.decision == Decision::Approve).count();

    // Evidence stages
    let stress = check_stress(input.stress);
    let walk_forward = check_walk_forward(input.walk_forward, cfg.require_walk_forward);
    let no_lookahead = check_audit(
        "no_lookahead",
        "no_lookahead_audit",
        input.no_lookahead,
        cfg.require_no_lookahead,
    );
    let trade_activity = check_audit(
        "trade_activity",
        "trade_activity_report",
        input.trade_activity,
        cfg.require_trade_activity,
    );
    for (name, stage, step) in [
        ("stress", &stress, "rerun_stress_harness"),
        ("walk_forward", &walk_forward, "run_walk_forward_evaluation"),
        ("no_lookahead", &no_lookahead, "run_no_lookahead_audit"),
        ("trade_activity", &trade_activity, "investigate_trade_activity"),
    ] {
        if let Some(id) = &stage.run_id {
            decision.evidence_run_ids.insert(name.to_string(), id.clone());
        }
        if !stage.ok {
            reasons.extend(stage.failures.iter().cloned());
            reasons.push(format!("{}_constraints_failed", name));
            next_steps.push(step);
        }
    }

    let current_pass = verdict.pass && beat_baselines && stress.ok && walk_forward.ok && no_lookahead.ok && trade_activity.ok;
    let total_passes = prior_passes + usize::from(current_pass);
    let outcome = if current_pass && total_passes >= cfg.window_passes_required {
        Decision::Approve
    } else {
        Decision::Reject
    };

    let consecutive = if outcome == Decision::Approve {
        1 + history
            .iter()
            .rev()
            .take_while(|d| d.decision == Decision::Approve)
            .count()
    } else {
        0
    };
    let auto_promote = outcome == Decision::Approve && consecutive >= cfg.auto_promote_consecutive;

    match outcome {
        Decision::Approve if reasons.0.is_empty() => reasons.push("risk_adjusted_outperformance"),
        Decision::Reject if reasons.0.is_empty() => {
            reasons.push("gate_rejected");
            if next_steps.0.is_empty() {
                next_steps.push("collect_more_runs_for_gate");
            }
        }
        _ => {}
    }

    decision.decision = outcome;
    decision.reasons = reasons.0;
    decision.required_next_steps = next_steps.0;
    decision.candidate_score = Some(score);
    decision.safety_pass = verdict.pass;
    decision.safety_failures = verdict.failures;
    decision.beat_baselines = beat_baselines;
    decision.current_pass = current_pass;
    decision.prior_window_passes = prior_passes;
    decision.window_passes = total_passes;
    decision.consecutive_approvals = consecutive;
    decision.auto_promote_eligible = auto_promote;
    decision.stress = stress;
    decision.walk_forward = walk_forward;
    decision.no_lookahead = no_lookahead;
    decision.trade_activity = trade_activity;

    log_decision(
        &decision.candidate_id,
        outcome.as_str(),
        &decision.reasons,
        total_passes,
        cfg.window_passes_required,
        auto_promote,
    );
    decision
}

// =============================================================================
// Persistence
// =============================================================================

/// Per-candidate JSONL history of gate decisions.
#[derive(Debug, Clone)]
pub struct DecisionLog {
    dir: PathBuf,
}

impl DecisionLog {
    pub fn new(runs_root: &Path) -> Self {
        Self {
            dir: runs_root.join(TOOL).join("decisions"),
        }
    }

    pub fn path_for(&self, candidate_id: &str) -> PathBuf {
        let mut name: String = candidate_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        if name.is_empty() || name.chars().all(|c| c == '.') {
            name = "_".to_string();
        }
        self.dir.join(format!("{}.jsonl", name))
    }

    /// Readable history, oldest first; malformed lines are skipped.
    pub fn history(&self, candidate_id: &str) -> Vec<PriorDecision> {
        let (mut rows, _skipped): (Vec<PriorDecision>, usize) = read_jsonl(&self.path_for(candidate_id));
        rows.retain(|d| d.candidate_id == candidate_id);
        rows.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        rows
    }

    pub fn latest(&self, candidate_id: &str) -> Option<PriorDecision> {
        self.history(candidate_id).pop()
    }

    pub fn append(&self, decision: &PromotionDecision) -> Result<()> {
        append_jsonl(&self.path_for(&decision.candidate_id), decision)
    }
}

/// Write `promotion_decision.json`, mirror it, and append to the decision log.
pub fn write_decision(decision: &PromotionDecision, pipeline: &PipelineConfig) -> Result<PathBuf> {
    let path = run_dir(&pipeline.runs_root, TOOL, &decision.run_id).join(DECISION_FILE);
    write_json_atomic(&path, decision)?;
    if pipeline.mirror_latest {
        mirror_latest(&path, &pipeline.runs_root, TOOL)?;
    }
    if !decision.candidate_id.is_empty() {
        DecisionLog::new(&pipeline.runs_root).append(decision)?;
    }
    Ok(path)
}

/// Record a decision in the registry.
///
/// REJECT records a rejection. APPROVE stores the candidate's overrides as a
/// policy version and, when auto-promotion is earned, makes it current.
pub fn apply_to_registry(
    decision: &PromotionDecision,
    candidate: Option<&CandidateMetrics>,
    store: &RegistryStore,
    evidence: Option<&str>,
) -> Result<Option<RegistryEvent>> {
    if decision.candidate_id.is_empty() {
        return Ok(None);
    }
    match decision.decision {
        Decision::Reject => Ok(Some(store.reject_policy(&decision.candidate_id, evidence)?)),
        Decision::Approve => {
            let current = store.load()?.current_policy_version;
            let overrides = candidate.map(|c| c.risk_overrides.clone()).unwrap_or_default();
            store.upsert_policy(
                &decision.candidate_id,
                overrides,
                Some(current.as_str()),
                PolicySource::Candidate,
                evidence,
            )?;
            if decision.auto_promote_eligible {
                Ok(Some(store.promote_policy(&decision.candidate_id, evidence)?))
            } else {
                Ok(None)
            }
        }
    }
}
