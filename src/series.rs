//! Quote series: the price input every simulation replays.
//!
//! Recorded series are read from the candle CSV layout
//! `ts,open,high,low,close,volume[,...]`; the close becomes the mid and the
//! bar's high-low range sets the quoted spread.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const MIN_SPREAD_BPS: f64 = 0.5;
const MAX_SPREAD_BPS: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub ts: u64,
    pub mid: f64,
    pub spread_bps: f64,
}

pub fn parse_csv_line(line: &str) -> Result<Quote> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 6 {
        return Err(anyhow!("expected 6+ columns, got {}", parts.len()));
    }
    let ts: u64 = parts[0].trim().parse()?;
    let h: f64 = parts[2].trim().parse()?;
    let l: f64 = parts[3].trim().parse()?;
    let c: f64 = parts[4].trim().parse()?;
    if !(c.is_finite() && c > 0.0) {
        return Err(anyhow!("non-positive close {}", c));
    }
    // A tenth of the bar range, clamped to a sane quoted spread.
    let spread_bps = ((h - l).abs() / c * 10_000.0 * 0.1).clamp(MIN_SPREAD_BPS, MAX_SPREAD_BPS);
    Ok(Quote { ts, mid: c, spread_bps })
}

/// Load a recorded series, skipping headers, comments and malformed rows.
pub fn load_quotes_csv(path: &Path) -> Result<Vec<Quote>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut quotes = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read error in {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.to_lowercase().starts_with("ts") {
            continue;
        }
        if let Ok(q) = parse_csv_line(trimmed) {
            quotes.push(q);
        }
    }
    if quotes.is_empty() {
        return Err(anyhow!("no usable quotes in {}", path.display()));
    }
    Ok(quotes)
}
