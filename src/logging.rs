//! Structured logging for the promotion pipeline.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Pipeline-stage domains for filtering
//! 3. Replay/audit support via sequence numbers and run ids
//! 4. stdout stays reserved for the one-line machine summary of each tool
//!
//! Records are single JSON objects written to stderr. When `LOG_DIR` is set
//! they are also appended to `<LOG_DIR>/<run_id>/events.jsonl` (trace/debug
//! go to `trace.jsonl`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (pipeline stages)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Safety,      // Threshold checks
    Tournament,  // Candidate simulation and scoring
    WalkForward, // Train/eval windows
    Stress,      // Friction scenarios
    Registry,    // Policy store mutations
    Gate,        // Promotion decisions
    Audit,       // No-lookahead / trade-activity audits
    Artifacts,   // Files written and mirrored
    System,      // Startup, config, recovery
    Profile,     // Timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Safety => "safety",
            Domain::Tournament => "tournament",
            Domain::WalkForward => "walk_forward",
            Domain::Stress => "stress",
            Domain::Registry => "registry",
            Domain::Gate => "gate",
            Domain::Audit => "audit",
            Domain::Artifacts => "artifacts",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter and run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct FileSinks {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    sinks: Option<FileSinks>,
}

fn open_append(path: PathBuf) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Some(f),
        Err(err) => {
            eprintln!("[log] failed to open {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let sinks = std::env::var("LOG_DIR").ok().and_then(|base| {
            let mut run_dir = PathBuf::from(base);
            run_dir.push(&run_id);
            if let Err(err) = create_dir_all(&run_dir) {
                eprintln!("[log] failed to create run dir: {}", err);
                return None;
            }
            let events = open_append(run_dir.join("events.jsonl"))?;
            let trace = open_append(run_dir.join("trace.jsonl"))?;
            Some(FileSinks {
                events: Mutex::new(BufWriter::new(events)),
                trace: Mutex::new(BufWriter::new(trace)),
            })
        });
        RunContext { run_id, sinks }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["candidate_id", "policy_version", "window_id", "scenario", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds (for replay correlation)
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(sinks) = &ctx.sinks {
        match level {
            Level::Trace | Level::Debug => write_line(&sinks.trace, &line),
            _ => write_line(&sinks.events, &line),
        }
    }
    eprintln!("{}", line);
}

// =============================================================================
// Pipeline logging helpers
// =============================================================================

pub fn log_safety_check(check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Safety,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_window(window_id: usize, chosen: Option<&str>, score: Option<f64>, pass: bool, failures: &[String]) {
    log(
        Level::Info,
        Domain::WalkForward,
        "window",
        obj(&[
            ("window_id", json!(window_id)),
            ("candidate_id", chosen.map(v_str).unwrap_or(Value::Null)),
            ("score", score.map(v_num).unwrap_or(Value::Null)),
            ("pass", json!(pass)),
            ("failures", json!(failures)),
        ]),
    );
}

pub fn log_scenario(scenario: &str, pass: bool, drawdown_pct: f64, turnover: u64, reject_rate: f64) {
    log(
        Level::Info,
        Domain::Stress,
        "scenario",
        obj(&[
            ("scenario", v_str(scenario)),
            ("pass", json!(pass)),
            ("max_drawdown_pct", v_num(drawdown_pct)),
            ("turnover", json!(turnover)),
            ("reject_rate", v_num(reject_rate)),
        ]),
    );
}

/// Log a promotion decision with the reasons behind it
pub fn log_decision(
    candidate_id: &str,
    decision: &str,
    reasons: &[String],
    window_passes: usize,
    window_required: usize,
    auto_promote: bool,
) {
    log(
        Level::Info,
        Domain::Gate,
        "decision",
        obj(&[
            ("candidate_id", v_str(candidate_id)),
            ("decision", v_str(decision)),
            ("reasons", json!(reasons)),
            ("window_passes", json!(window_passes)),
            ("window_required", json!(window_required)),
            ("auto_promote_eligible", json!(auto_promote)),
        ]),
    );
}

pub fn log_registry_event(action: &str, policy_version: &str, evidence: Option<&str>) {
    log(
        Level::Info,
        Domain::Registry,
        action,
        obj(&[
            ("policy_version", v_str(policy_version)),
            ("evidence", evidence.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_artifact(path: &str, sha256: &str, bytes: usize) {
    log(
        Level::Debug,
        Domain::Artifacts,
        "written",
        obj(&[
            ("path", v_str(path)),
            ("sha256", v_str(sha256)),
            ("bytes", json!(bytes)),
        ]),
    );
}

// =============================================================================
// Summary line
// =============================================================================

/// One pipe-delimited `key=value` line for orchestration layers.
///
/// Values are sanitized so the line always splits cleanly on `|` and `=`.
pub fn summary_line(tool: &str, pairs: &[(&str, String)]) -> String {
    let mut parts = Vec::with_capacity(pairs.len() + 1);
    parts.push(format!("tool={}", sanitize_summary_value(tool)));
    for (k, v) in pairs {
        parts.push(format!("{}={}", k, sanitize_summary_value(v)));
    }
    parts.join("|")
}

fn sanitize_summary_value(v: &str) -> String {
    v.chars()
        .map(|c| match c {
            '|' | '=' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: None,
            started: Instant::now(),
            enabled: Self::should_sample(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================
