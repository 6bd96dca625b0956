//! Walk-forward evaluation.
//!
//! One synthetic series is cut into contiguous, non-overlapping
//! `train | eval` windows. On each window the tournament picks the best
//! candidate from the train segment, then the pick is re-scored alone
//! (plus baselines) on the eval segment. The out-of-sample result decides
//! whether the window passes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{mirror_latest, run_dir, write_json_atomic, write_jsonl_atomic, ArtifactRecord};
use crate::candidate::{select_rotation, Candidate};
use crate::config::{PipelineConfig, WalkForwardConfig};
use crate::logging::{log, log_window, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::safety;
use crate::series::Quote;
use crate::synthetic;
use crate::tournament::TournamentRunner;

pub const SCHEMA_VERSION: &str = "walk_forward.v1";
pub const TOOL: &str = "walk_forward";
pub const RESULT_FILE: &str = "walk_forward_result.json";
pub const WINDOWS_FILE: &str = "walk_forward_windows.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalkForwardStatus {
    Pass,
    Fail,
    InsufficientData,
}

impl WalkForwardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalkForwardStatus::Pass => "PASS",
            WalkForwardStatus::Fail => "FAIL",
            WalkForwardStatus::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

/// Inclusive index range into the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub fn overlaps(&self, other: &IndexRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub window_id: usize,
    pub train_range: IndexRange,
    pub train_ts: TsRange,
    pub eval_range: IndexRange,
    pub eval_ts: TsRange,
    pub chosen_candidate_id: Option<String>,
    pub candidate_score: Option<f64>,
    pub baseline_scores: BTreeMap<String, f64>,
    pub baselines_beaten: BTreeSet<String>,
    pub pass: bool,
    pub safety_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    pub schema_version: String,
    pub ts_utc: String,
    pub ts_epoch_ms: i64,
    pub run_id: String,
    pub seed: u64,
    pub window_count: usize,
    pub train_size: usize,
    pub eval_size: usize,
    pub pass_count: usize,
    pub pass_rate: f64,
    /// Same as `pass_count`; the name the promotion gate reads
    pub window_passes: usize,
    pub window_passes_required: usize,
    pub min_pass_rate: f64,
    pub min_windows_required: usize,
    pub min_baseline_beats: usize,
    pub status: WalkForwardStatus,
    pub baselines: Vec<String>,
    pub candidates_considered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkForwardRun {
    pub summary: WalkForwardSummary,
    pub windows: Vec<EvaluationWindow>,
}

/// Train and eval ranges of window `i`. Eval starts right after train ends.
pub fn window_bounds(i: usize, train_size: usize, eval_size: usize) -> (IndexRange, IndexRange) {
    let start = i * (train_size + eval_size);
    let train = IndexRange {
        start,
        end: start + train_size - 1,
    };
    let eval = IndexRange {
        start: train.end + 1,
        end: train.end + eval_size,
    };
    (train, eval)
}

pub fn classify(windows: usize, pass_rate: f64, cfg: &WalkForwardConfig) -> WalkForwardStatus {
    if windows < cfg.min_windows_required {
        WalkForwardStatus::InsufficientData
    } else if pass_rate < cfg.min_pass_rate {
        WalkForwardStatus::Fail
    } else {
        WalkForwardStatus::Pass
    }
}

fn ts_range(segment: &[Quote]) -> TsRange {
    TsRange {
        start: segment.first().map(|q| q.ts).unwrap_or(0),
        end: segment.last().map(|q| q.ts).unwrap_or(0),
    }
}

/// Run the full walk-forward evaluation over a freshly generated series.
pub fn evaluate(
    cfg: &WalkForwardConfig,
    runner: &mut dyn TournamentRunner,
    pool: &[Candidate],
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<WalkForwardRun> {
    if cfg.train_size == 0 || cfg.eval_size == 0 {
        bail!("train_size and eval_size must be positive");
    }
    let _profile = ProfileScope::with_context("walk_forward", &[("windows", serde_json::json!(cfg.windows))]);
    let series = synthetic::generate(cfg.series_len(), cfg.seed);
    let selected = select_rotation(pool, cfg.seed, cfg.candidate_count);

    log(
        Level::Info,
        Domain::WalkForward,
        "start",
        obj(&[
            ("run_id", v_str(run_id)),
            ("seed", serde_json::json!(cfg.seed)),
            ("windows", serde_json::json!(cfg.windows)),
            ("series_len", serde_json::json!(series.len())),
            (
                "candidates",
                serde_json::json!(selected.iter().map(|c| c.id.as_str()).collect::<Vec<_>>()),
            ),
        ]),
    );

    let mut windows = Vec::with_capacity(cfg.windows);
    for i in 0..cfg.windows {
        let window = evaluate_window(cfg, runner, &series, &selected, i)?;
        log_window(
            window.window_id,
            window.chosen_candidate_id.as_deref(),
            window.candidate_score,
            window.pass,
            &window.safety_failures,
        );
        windows.push(window);
    }

    let pass_count = windows.iter().filter(|w| w.pass).count();
    let pass_rate = if cfg.windows > 0 {
        pass_count as f64 / cfg.windows as f64
    } else {
        0.0
    };
    let status = classify(cfg.windows, pass_rate, cfg);
    log(
        Level::Info,
        Domain::WalkForward,
        "summary",
        obj(&[
            ("status", v_str(status.as_str())),
            ("pass_count", serde_json::json!(pass_count)),
            ("pass_rate", v_num(pass_rate)),
        ]),
    );

    let summary = WalkForwardSummary {
        schema_version: SCHEMA_VERSION.to_string(),
        ts_utc: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ts_epoch_ms: now.timestamp_millis(),
        run_id: run_id.to_string(),
        seed: cfg.seed,
        window_count: cfg.windows,
        train_size: cfg.train_size,
        eval_size: cfg.eval_size,
        pass_count,
        pass_rate,
        window_passes: pass_count,
        window_passes_required: cfg.window_passes_required(),
        min_pass_rate: cfg.min_pass_rate,
        min_windows_required: cfg.min_windows_required,
        min_baseline_beats: cfg.min_baseline_beats,
        status,
        baselines: runner.baseline_ids(),
        candidates_considered: selected.iter().map(|c| c.id.clone()).collect(),
    };
    Ok(WalkForwardRun { summary, windows })
}

fn evaluate_window(
    cfg: &WalkForwardConfig,
    runner: &mut dyn TournamentRunner,
    series: &[Quote],
    selected: &[Candidate],
    i: usize,
) -> Result<EvaluationWindow> {
    let (train_range, eval_range) = window_bounds(i, cfg.train_size, cfg.eval_size);
    let train = &series[train_range.start..=train_range.end];
    let eval = &series[eval_range.start..=eval_range.end];
    let seed = cfg.seed.wrapping_add(i as u64);

    let mut window = EvaluationWindow {
        window_id: i,
        train_range,
        train_ts: ts_range(train),
        eval_range,
        eval_ts: ts_range(eval),
        chosen_candidate_id: None,
        candidate_score: None,
        baseline_scores: BTreeMap::new(),
        baselines_beaten: BTreeSet::new(),
        pass: false,
        safety_failures: Vec::new(),
    };

    let trained = runner
        .run(train, selected, seed)
        .with_context(|| format!("train tournament failed for window {}", i))?;
    let Some(best) = trained.best_candidate() else {
        window.safety_failures.push("no_candidate_selected".to_string());
        return Ok(window);
    };
    let Some(chosen) = selected.iter().find(|c| c.id == best.id) else {
        window.safety_failures.push("no_candidate_selected".to_string());
        return Ok(window);
    };

    let scored = runner
        .run(eval, std::slice::from_ref(chosen), seed)
        .with_context(|| format!("eval tournament failed for window {}", i))?;
    window.chosen_candidate_id = Some(chosen.id.clone());
    window.baseline_scores = scored.baseline_scores();

    let Some(entry) = scored.entry(&chosen.id) else {
        window.safety_failures.push("candidate_not_scored".to_string());
        return Ok(window);
    };
    window.candidate_score = Some(entry.score);
    window.baselines_beaten = window
        .baseline_scores
        .iter()
        .filter(|(_, score)| entry.score > **score)
        .map(|(id, _)| id.clone())
        .collect();

    let verdict = safety::evaluate(&entry.metrics.safety_inputs(), &cfg.thresholds);
    window.safety_failures.extend(verdict.failures.iter().cloned());
    window.safety_failures.extend(entry.safety_failures.iter().cloned());
    window.pass = verdict.pass && entry.safety_pass && window.baselines_beaten.len() >= cfg.min_baseline_beats;
    Ok(window)
}

/// Paths written by one walk-forward run.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkForwardArtifacts {
    pub result_path: PathBuf,
    pub windows_path: PathBuf,
    pub records: Vec<ArtifactRecord>,
}

pub fn write_artifacts(run: &WalkForwardRun, pipeline: &PipelineConfig) -> Result<WalkForwardArtifacts> {
    let dir = run_dir(&pipeline.runs_root, TOOL, &run.summary.run_id);
    let result_path = dir.join(RESULT_FILE);
    let windows_path = dir.join(WINDOWS_FILE);

    let mut records = vec![
        write_json_atomic(&result_path, &run.summary)?,
        write_jsonl_atomic(&windows_path, &run.windows)?,
    ];
    if pipeline.mirror_latest {
        records.push(mirror_latest(&result_path, &pipeline.runs_root, TOOL)?);
        records.push(mirror_latest(&windows_path, &pipeline.runs_root, TOOL)?);
    }
    Ok(WalkForwardArtifacts {
        result_path,
        windows_path,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{candidate_pool, Family};
    use crate::metrics::RunMetrics;
    use crate::tournament::{TournamentEntry, TournamentResult};

    /// Runner with fixed scores: every candidate scores `cand`, baselines
    /// score from `baselines`.
    struct FixedRunner {
        cand: f64,
        baselines: Vec<(&'static str, f64)>,
        metrics: RunMetrics,
        calls: usize,
    }

    impl FixedRunner {
        fn new(cand: f64) -> Self {
            Self {
                cand,
                baselines: vec![("no_trade", 10_000.0), ("buy_hold", 10_050.0), ("naive_trend", 10_200.0)],
                metrics: RunMetrics {
                    final_equity: 10_100.0,
                    max_drawdown_pct: 1.0,
                    turnover: 4,
                    ..Default::default()
                },
                calls: 0,
            }
        }
    }

    impl TournamentRunner for FixedRunner {
        fn run(&mut self, _segment: &[Quote], candidates: &[Candidate], _seed: u64) -> Result<TournamentResult> {
            self.calls += 1;
            let mut entries: Vec<TournamentEntry> = candidates
                .iter()
                .enumerate()
                .map(|(k, c)| TournamentEntry {
                    id: c.id.clone(),
                    family: c.family.as_str().to_string(),
                    is_baseline: false,
                    score: self.cand + k as f64,
                    metrics: self.metrics.clone(),
                    safety_pass: true,
                    safety_failures: Vec::new(),
                })
                .collect();
            for (id, score) in &self.baselines {
                entries.push(TournamentEntry {
                    id: id.to_string(),
                    family: Family::Flat.as_str().to_string(),
                    is_baseline: true,
                    score: *score,
                    metrics: RunMetrics::default(),
                    safety_pass: true,
                    safety_failures: Vec::new(),
                });
            }
            Ok(TournamentResult { entries })
        }

        fn baseline_ids(&self) -> Vec<String> {
            self.baselines.iter().map(|(id, _)| id.to_string()).collect()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_windows_never_look_ahead() {
        for (train, eval) in [(240, 120), (60, 30), (1, 1), (7, 3)] {
            let ranges: Vec<_> = (0..6).map(|i| window_bounds(i, train, eval)).collect();
            for (i, (t, e)) in ranges.iter().enumerate() {
                assert_eq!(e.start, t.end + 1);
                assert_eq!(t.end - t.start + 1, train);
                assert_eq!(e.end - e.start + 1, eval);
                for (j, (other_t, _)) in ranges.iter().enumerate() {
                    if i != j {
                        assert!(!e.overlaps(other_t), "eval {} overlaps train {}", i, j);
                    }
                }
            }
        }
    }

    #[test]
    fn test_classify_order() {
        let cfg = WalkForwardConfig::default();
        assert_eq!(classify(2, 1.0, &cfg), WalkForwardStatus::InsufficientData);
        assert_eq!(classify(6, 0.5, &cfg), WalkForwardStatus::Fail);
        assert_eq!(classify(6, 0.6, &cfg), WalkForwardStatus::Pass);
    }

    #[test]
    fn test_window_passes_when_two_baselines_beaten() {
        let cfg = WalkForwardConfig::default().tiny();
        let mut runner = FixedRunner::new(10_100.0);
        let run = evaluate(&cfg, &mut runner, &candidate_pool(), "wf-test", now()).unwrap();
        assert_eq!(run.windows.len(), 3);
        // two tournaments per window
        assert_eq!(runner.calls, 6);
        for w in &run.windows {
            assert!(w.pass, "window {} failed: {:?}", w.window_id, w.safety_failures);
            assert_eq!(w.baselines_beaten.len(), 2);
            assert!(!w.baselines_beaten.contains("naive_trend"));
        }
        assert_eq!(run.summary.status, WalkForwardStatus::Pass);
        assert_eq!(run.summary.pass_rate, 1.0);
        assert_eq!(run.summary.window_passes, 3);
    }

    #[test]
    fn test_window_fails_when_too_few_baselines_beaten() {
        let cfg = WalkForwardConfig::default().tiny();
        let mut runner = FixedRunner::new(10_020.0);
        let run = evaluate(&cfg, &mut runner, &candidate_pool(), "wf-test", now()).unwrap();
        assert!(run.windows.iter().all(|w| !w.pass));
        assert_eq!(run.summary.status, WalkForwardStatus::Fail);
    }

    #[test]
    fn test_unsafe_eval_metrics_fail_window() {
        let cfg = WalkForwardConfig::default().tiny();
        let mut runner = FixedRunner::new(20_000.0);
        runner.metrics.max_drawdown_pct = 9.0;
        let run = evaluate(&cfg, &mut runner, &candidate_pool(), "wf-test", now()).unwrap();
        let w = &run.windows[0];
        assert!(!w.pass);
        assert_eq!(w.safety_failures, vec!["drawdown>5.00%".to_string()]);
    }

    #[test]
    fn test_too_few_windows_is_insufficient() {
        let cfg = WalkForwardConfig {
            windows: 2,
            ..WalkForwardConfig::default().tiny()
        };
        let run = evaluate(&cfg, &mut FixedRunner::new(10_100.0), &candidate_pool(), "wf", now()).unwrap();
        assert_eq!(run.summary.status, WalkForwardStatus::InsufficientData);
    }

    #[test]
    fn test_chosen_candidate_comes_from_rotation() {
        let cfg = WalkForwardConfig::default().tiny();
        let pool = candidate_pool();
        let run = evaluate(&cfg, &mut FixedRunner::new(10_100.0), &pool, "wf", now()).unwrap();
        let expected = select_rotation(&pool, cfg.seed, cfg.candidate_count);
        // FixedRunner scores later entries higher
        assert_eq!(run.windows[0].chosen_candidate_id.as_deref(), Some(expected[1].id.as_str()));
        assert_eq!(run.summary.candidates_considered.len(), 2);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let cfg = WalkForwardConfig {
            eval_size: 0,
            ..Default::default()
        };
        assert!(evaluate(&cfg, &mut FixedRunner::new(1.0), &candidate_pool(), "wf", now()).is_err());
    }
}
