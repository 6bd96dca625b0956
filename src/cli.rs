//! Minimal flag parsing shared by the binaries.
//!
//! Accepts `--flag value`, `--flag=value` and bare `--switch`. Anything that
//! is not a flag or a flag's value is a positional argument.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, Result};

pub const EXIT_PASS: u8 = 0;
pub const EXIT_FAIL: u8 = 1;
pub const EXIT_ERROR: u8 = 2;

pub fn exit(code: u8) -> ExitCode {
    ExitCode::from(code)
}

#[derive(Debug, Clone, Default)]
pub struct Args {
    args: Vec<String>,
}

impl Args {
    pub fn from_env() -> Self {
        Self::new(std::env::args().skip(1).collect())
    }

    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    /// Value of `--name value` or `--name=value`.
    pub fn value(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}=", name);
        if let Some(v) = self.args.iter().find_map(|a| a.strip_prefix(prefix.as_str())) {
            return Some(v);
        }
        self.args
            .iter()
            .position(|a| a == name)
            .and_then(|i| self.args.get(i + 1))
            .filter(|v| !v.starts_with("--"))
            .map(|s| s.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    pub fn path(&self, name: &str) -> Option<PathBuf> {
        self.value(name).map(PathBuf::from)
    }

    /// Parsed value, `default` when the flag is absent, an error when it is
    /// present but malformed.
    pub fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.value(name) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| anyhow!("invalid value for {}: {}", name, v)),
        }
    }

    /// `--name` forces true, `--no-name` forces false, otherwise `default`.
    pub fn switch(&self, name: &str, default: bool) -> bool {
        let negated = format!("--no-{}", name.trim_start_matches("--"));
        if self.has(&negated) {
            false
        } else if self.has(name) {
            true
        } else {
            default
        }
    }

    /// Arguments that are neither flags nor flag values.
    ///
    /// `switches` lists the flags that take no value.
    pub fn positional(&self, switches: &[&str]) -> Vec<&str> {
        let mut out = Vec::new();
        let mut skip_next = false;
        for a in &self.args {
            if skip_next {
                skip_next = false;
                continue;
            }
            if a.starts_with("--") {
                let is_switch = a.contains('=') || switches.contains(&a.as_str()) || a.starts_with("--no-");
                skip_next = !is_switch;
                continue;
            }
            out.push(a.as_str());
        }
        out
    }
}
