//! Execution friction: fees, slippage, spread, latency and partial fills.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::env_parse;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrictionPolicy {
    pub fee_bps: f64,
    pub slippage_bps: f64,
    /// Added on top of the quote's own spread
    pub spread_bps: f64,
    pub latency_ms: u64,
    /// Probability that a fill is partial (0.0-1.0)
    pub partial_fill_prob: f64,
    /// Upper bound on the filled fraction of any order (0.0-1.0)
    pub max_fill_fraction: f64,
}

impl Default for FrictionPolicy {
    fn default() -> Self {
        Self {
            fee_bps: 1.0,
            slippage_bps: 2.0,
            spread_bps: 3.0,
            latency_ms: 250,
            partial_fill_prob: 0.1,
            max_fill_fraction: 1.0,
        }
    }
}

impl FrictionPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fee_bps: env_parse("FEE_BPS", d.fee_bps),
            slippage_bps: env_parse("SLIPPAGE_BPS", d.slippage_bps),
            spread_bps: env_parse("SPREAD_BPS", d.spread_bps),
            latency_ms: env_parse("LATENCY_MS", d.latency_ms),
            partial_fill_prob: env_parse("PARTIAL_FILL_PROB", d.partial_fill_prob),
            max_fill_fraction: env_parse("MAX_FILL_FRACTION", d.max_fill_fraction),
        }
    }

    /// Apply scenario multipliers, floors and caps.
    pub fn scaled(&self, m: &FrictionMultipliers) -> Self {
        let mut out = Self {
            fee_bps: self.fee_bps * m.fee,
            slippage_bps: self.slippage_bps * m.slippage,
            spread_bps: self.spread_bps * m.spread,
            latency_ms: (self.latency_ms as f64 * m.latency).round() as u64,
            partial_fill_prob: self.partial_fill_prob,
            max_fill_fraction: self.max_fill_fraction,
        };
        if let Some(floor) = m.partial_fill_floor {
            out.partial_fill_prob = out.partial_fill_prob.max(floor);
        }
        if let Some(cap) = m.max_fill_cap {
            out.max_fill_fraction = out.max_fill_fraction.min(cap);
        }
        out
    }

    /// Execution price for a signed quantity against a mid price.
    ///
    /// Buys pay half the effective spread plus slippage, sells receive the
    /// mirror image.
    pub fn fill_price(&self, mid: f64, qty: f64, quote_spread_bps: f64) -> f64 {
        let half_spread = self.effective_spread_bps(quote_spread_bps) / 2.0;
        let impact = (half_spread + self.slippage_bps) / 10_000.0;
        if qty >= 0.0 {
            mid * (1.0 + impact)
        } else {
            mid * (1.0 - impact)
        }
    }

    pub fn fee(&self, notional: f64) -> f64 {
        notional.abs() * self.fee_bps / 10_000.0
    }

    pub fn effective_spread_bps(&self, quote_spread_bps: f64) -> f64 {
        quote_spread_bps.max(0.0) + self.spread_bps
    }
}

/// Multipliers a stress scenario applies to the base friction policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrictionMultipliers {
    pub fee: f64,
    pub slippage: f64,
    pub spread: f64,
    pub latency: f64,
    pub partial_fill_floor: Option<f64>,
    pub max_fill_cap: Option<f64>,
}

impl Default for FrictionMultipliers {
    fn default() -> Self {
        Self {
            fee: 1.0,
            slippage: 1.0,
            spread: 1.0,
            latency: 1.0,
            partial_fill_floor: None,
            max_fill_cap: None,
        }
    }
}

impl FrictionMultipliers {
    /// Flat map used in scenario evidence.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("fee".to_string(), self.fee);
        map.insert("slippage".to_string(), self.slippage);
        map.insert("spread".to_string(), self.spread);
        map.insert("latency".to_string(), self.latency);
        if let Some(floor) = self.partial_fill_floor {
            map.insert("partial_fill_prob_floor".to_string(), floor);
        }
        if let Some(cap) = self.max_fill_cap {
            map.insert("max_fill_fraction_cap".to_string(), cap);
        }
        map
    }
}

/// Deterministic latency with bounded jitter in `[base, base + base/2]`.
/// Xorshift over the submit time and order sequence.
pub fn latency_delay_ms(submit_ts: u64, order_seq: u64, base_ms: u64) -> u64 {
    let span = base_ms / 2 + 1;
    let mut x = submit_ts ^ order_seq.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    base_ms + (x % span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_applies_multipliers() {
        let base = FrictionPolicy::default();
        let m = FrictionMultipliers {
            slippage: 3.0,
            spread: 2.0,
            ..Default::default()
        };
        let s = base.scaled(&m);
        assert_eq!(s.slippage_bps, base.slippage_bps * 3.0);
        assert_eq!(s.spread_bps, base.spread_bps * 2.0);
        assert_eq!(s.fee_bps, base.fee_bps);
        assert_eq!(s.latency_ms, base.latency_ms);
    }

    #[test]
    fn test_floor_and_cap() {
        let base = FrictionPolicy::default();
        let m = FrictionMultipliers {
            latency: 2.0,
            partial_fill_floor: Some(0.35),
            max_fill_cap: Some(0.6),
            ..Default::default()
        };
        let s = base.scaled(&m);
        assert_eq!(s.latency_ms, 500);
        assert_eq!(s.partial_fill_prob, 0.35);
        assert_eq!(s.max_fill_fraction, 0.6);

        let already_high = FrictionPolicy {
            partial_fill_prob: 0.5,
            max_fill_fraction: 0.4,
            ..base
        };
        let s = already_high.scaled(&m);
        assert_eq!(s.partial_fill_prob, 0.5);
        assert_eq!(s.max_fill_fraction, 0.4);
    }

    #[test]
    fn test_fill_price_is_adverse() {
        let f = FrictionPolicy::default();
        assert!(f.fill_price(100.0, 1.0, 2.0) > 100.0);
        assert!(f.fill_price(100.0, -1.0, 2.0) < 100.0);
    }

    #[test]
    fn test_latency_delay_deterministic_and_bounded() {
        let d1 = latency_delay_ms(1700, 3, 250);
        let d2 = latency_delay_ms(1700, 3, 250);
        assert_eq!(d1, d2);
        for seq in 0..50 {
            let d = latency_delay_ms(1_700_000_000 + seq * 60, seq, 250);
            assert!((250..=375).contains(&d));
        }
    }

    #[test]
    fn test_multiplier_map_includes_caps_only_when_set() {
        let plain = FrictionMultipliers::default().to_map();
        assert_eq!(plain.len(), 4);
        let c = FrictionMultipliers {
            partial_fill_floor: Some(0.35),
            max_fill_cap: Some(0.6),
            ..Default::default()
        }
        .to_map();
        assert_eq!(c.len(), 6);
    }
}
