//! Evidence audits consumed by the promotion gate.
//!
//! - no-lookahead: every walk-forward eval range starts after its train range
//!   and touches no other window's train range
//! - trade-activity: every stress scenario actually traded, and none breached
//!   the reject-rate limit

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{mirror_latest, run_dir, write_json_atomic};
use crate::config::PipelineConfig;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::stress::StressReport;
use crate::walk_forward::EvaluationWindow;

pub const TOOL: &str = "audit";
pub const NO_LOOKAHEAD_FILE: &str = "no_lookahead_audit.json";
pub const TRADE_ACTIVITY_FILE: &str = "trade_activity_report.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoLookaheadAudit {
    pub run_id: String,
    pub ts_utc: String,
    pub source_run_id: String,
    pub windows_checked: usize,
    pub status: String,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeActivityReport {
    pub run_id: String,
    pub ts_utc: String,
    pub source_run_id: String,
    pub min_trades: u64,
    pub max_reject_rate: f64,
    pub scenarios_checked: usize,
    pub status: String,
    pub violations: Vec<String>,
}

fn status(violations: &[String]) -> &'static str {
    if violations.is_empty() {
        "PASS"
    } else {
        "FAIL"
    }
}

pub fn audit_no_lookahead(
    windows: &[EvaluationWindow],
    source_run_id: &str,
    run_id: &str,
    now: DateTime<Utc>,
) -> NoLookaheadAudit {
    let mut violations = Vec::new();
    for w in windows {
        if w.eval_range.start <= w.train_range.end {
            violations.push(format!("window_{}:eval_starts_before_train_end", w.window_id));
        }
        if w.eval_ts.start <= w.train_ts.end {
            violations.push(format!("window_{}:eval_ts_not_after_train_ts", w.window_id));
        }
        for other in windows.iter().filter(|o| o.window_id != w.window_id) {
            if w.eval_range.overlaps(&other.train_range) {
                violations.push(format!(
                    "window_{}:eval_overlaps_train_of_window_{}",
                    w.window_id, other.window_id
                ));
            }
        }
    }
    let audit = NoLookaheadAudit {
        run_id: run_id.to_string(),
        ts_utc: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        source_run_id: source_run_id.to_string(),
        windows_checked: windows.len(),
        status: status(&violations).to_string(),
        violations,
    };
    log_audit("no_lookahead", &audit.status, audit.violations.len());
    audit
}

pub fn audit_trade_activity(
    report: &StressReport,
    min_trades: u64,
    max_reject_rate: f64,
    run_id: &str,
    now: DateTime<Utc>,
) -> TradeActivityReport {
    let mut violations = Vec::new();
    if report.scenarios.is_empty() {
        violations.push("no_scenarios".to_string());
    }
    for s in &report.scenarios {
        if s.metrics.turnover < min_trades {
            violations.push(format!("{}:trades<{}", s.scenario.as_str(), min_trades));
        }
        if s.metrics.reject_rate > max_reject_rate {
            violations.push(format!("{}:reject_rate>{:.2}", s.scenario.as_str(), max_reject_rate));
        }
    }
    let out = TradeActivityReport {
        run_id: run_id.to_string(),
        ts_utc: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        source_run_id: report.run_id.clone(),
        min_trades,
        max_reject_rate,
        scenarios_checked: report.scenarios.len(),
        status: status(&violations).to_string(),
        violations,
    };
    log_audit("trade_activity", &out.status, out.violations.len());
    out
}

fn log_audit(kind: &str, status: &str, violations: usize) {
    let level = if violations == 0 { Level::Info } else { Level::Warn };
    log(
        level,
        Domain::Audit,
        kind,
        obj(&[("status", v_str(status)), ("violations", serde_json::json!(violations))]),
    );
}

/// Write an audit under `<runs_root>/audit/<run_id>/` and mirror it.
pub fn write_audit<T: Serialize>(
    audit: &T,
    file_name: &str,
    run_id: &str,
    pipeline: &PipelineConfig,
) -> Result<PathBuf> {
    let path = run_dir(&pipeline.runs_root, TOOL, run_id).join(file_name);
    write_json_atomic(&path, audit)?;
    if pipeline.mirror_latest {
        mirror_latest(&path, &pipeline.runs_root, TOOL)?;
    }
    Ok(path)
}
