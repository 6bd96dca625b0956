//! Safety evaluator: metrics + thresholds → pass/fail with failure codes.

use serde::{Deserialize, Serialize};

use crate::config::env_parse;
use crate::logging::log_safety_check;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyThresholds {
    pub max_drawdown_pct: f64,
    pub max_turnover: u64,
    pub max_reject_rate: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 5.0,
            max_turnover: 120,
            max_reject_rate: 0.2,
        }
    }
}

impl SafetyThresholds {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_drawdown_pct: env_parse("MAX_DRAWDOWN_PCT", d.max_drawdown_pct),
            max_turnover: env_parse("MAX_TURNOVER", d.max_turnover),
            max_reject_rate: env_parse("MAX_REJECT_RATE", d.max_reject_rate),
        }
    }
}

/// The three quantities the evaluator looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyInputs {
    pub drawdown_pct: f64,
    pub turnover: u64,
    pub reject_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub pass: bool,
    pub failures: Vec<String>,
}

/// Check every threshold independently; equality at a threshold passes.
///
/// NaN inputs fail their check rather than slipping through the comparison.
pub fn evaluate(m: &SafetyInputs, t: &SafetyThresholds) -> SafetyVerdict {
    let mut failures = Vec::new();

    let dd_ok = m.drawdown_pct <= t.max_drawdown_pct;
    log_safety_check("drawdown", verdict_str(dd_ok), m.drawdown_pct, t.max_drawdown_pct);
    if !dd_ok {
        failures.push(format!("drawdown>{:.2}%", t.max_drawdown_pct));
    }

    let turnover_ok = m.turnover <= t.max_turnover;
    log_safety_check("turnover", verdict_str(turnover_ok), m.turnover as f64, t.max_turnover as f64);
    if !turnover_ok {
        failures.push(format!("turnover>{}", t.max_turnover));
    }

    let reject_ok = m.reject_rate <= t.max_reject_rate;
    log_safety_check("reject_rate", verdict_str(reject_ok), m.reject_rate, t.max_reject_rate);
    if !reject_ok {
        failures.push(format!("reject_rate>{:.2}", t.max_reject_rate));
    }

    SafetyVerdict {
        pass: failures.is_empty(),
        failures,
    }
}

fn verdict_str(ok: bool) -> &'static str {
    if ok {
        "pass"
    } else {
        "fail"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(dd: f64, turnover: u64, rr: f64) -> SafetyInputs {
        SafetyInputs {
            drawdown_pct: dd,
            turnover,
            reject_rate: rr,
        }
    }

    #[test]
    fn test_equality_at_every_threshold_passes() {
        let t = SafetyThresholds::default();
        let v = evaluate(&inputs(5.0, 120, 0.2), &t);
        assert!(v.pass, "{:?}", v.failures);
        assert!(v.failures.is_empty());
    }

    #[test]
    fn test_drawdown_violation_code() {
        let t = SafetyThresholds::default();
        let v = evaluate(&inputs(5.01, 10, 0.0), &t);
        assert!(!v.pass);
        assert_eq!(v.failures, vec!["drawdown>5.00%".to_string()]);
    }

    #[test]
    fn test_all_violations_reported_in_order() {
        let t = SafetyThresholds {
            max_drawdown_pct: 2.5,
            max_turnover: 10,
            max_reject_rate: 0.05,
        };
        let v = evaluate(&inputs(3.0, 11, 0.5), &t);
        assert!(!v.pass);
        assert_eq!(
            v.failures,
            vec![
                "drawdown>2.50%".to_string(),
                "turnover>10".to_string(),
                "reject_rate>0.05".to_string()
            ]
        );
    }

    #[test]
    fn test_nan_drawdown_fails() {
        let v = evaluate(&inputs(f64::NAN, 0, 0.0), &SafetyThresholds::default());
        assert!(!v.pass);
        assert_eq!(v.failures.len(), 1);
    }

    #[test]
    fn test_pass_iff_all_hold() {
        let t = SafetyThresholds::default();
        for dd in [0.0, 4.99, 5.0, 5.01] {
            for to in [0u64, 120, 121] {
                for rr in [0.0, 0.2, 0.21] {
                    let expected = dd <= 5.0 && to <= 120 && rr <= 0.2;
                    assert_eq!(evaluate(&inputs(dd, to, rr), &t).pass, expected);
                }
            }
        }
    }
}
