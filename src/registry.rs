//! Versioned policy registry with promotion/rejection history.
//!
//! There is no long-lived in-memory instance: every operation loads the file,
//! mutates, and writes it back atomically. Corrupt or missing state is healed
//! from the seed file or a hard-coded `baseline` policy and persisted at once.
//!
//! No cross-process locking is done; concurrent writers are last-writer-wins.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::write_json_atomic;
use crate::config::PipelineConfig;
use crate::logging::{log, log_registry_event, obj, v_str, Domain, Level};

pub const BASELINE_VERSION: &str = "baseline";

/// The only override keys a policy may carry.
pub const OVERRIDE_WHITELIST: [&str; 7] = [
    "max_orders_per_minute",
    "max_drawdown",
    "cooldown_seconds",
    "max_position",
    "max_spread_bps",
    "max_latency_ms",
    "max_turnover",
];

pub fn is_whitelisted(key: &str) -> bool {
    OVERRIDE_WHITELIST.contains(&key)
}

/// Risk overrides restricted to `OVERRIDE_WHITELIST` with numeric values.
///
/// Anything else is dropped on construction, including on deserialization,
/// so a registry file edited by hand can never smuggle extra keys through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct RiskOverrides(BTreeMap<String, f64>);

impl RiskOverrides {
    pub fn filtered<I, K>(raw: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (k, v) in raw {
            let k = k.into();
            if !is_whitelisted(&k) {
                continue;
            }
            if let Some(n) = v.as_f64().filter(|n| n.is_finite()) {
                map.insert(k, n);
            }
        }
        Self(map)
    }

    pub fn from_pairs(pairs: &[(&str, f64)]) -> Self {
        Self::filtered(pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))))
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for RiskOverrides {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        Self::filtered(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    Seed,
    Candidate,
    Manual,
}

impl PolicySource {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seed" => Some(PolicySource::Seed),
            "candidate" => Some(PolicySource::Candidate),
            "manual" => Some(PolicySource::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    #[serde(default)]
    pub risk_overrides: RiskOverrides,
    pub created_ts_utc: String,
    pub source: PolicySource,
    #[serde(default)]
    pub based_on: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
}

impl Policy {
    pub fn baseline(now: DateTime<Utc>) -> Self {
        Self {
            version: BASELINE_VERSION.to_string(),
            risk_overrides: RiskOverrides::default(),
            created_ts_utc: ts_utc(now),
            source: PolicySource::Seed,
            based_on: None,
            evidence: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryAction {
    Promoted,
    Rejected,
}

impl RegistryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryAction::Promoted => "PROMOTED",
            RegistryAction::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub action: RegistryAction,
    pub policy_version: String,
    #[serde(default)]
    pub evidence: Option<String>,
    pub ts_utc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRegistry {
    pub current_policy_version: String,
    #[serde(default)]
    pub policies: BTreeMap<String, Policy>,
    #[serde(default)]
    pub history: Vec<RegistryEvent>,
}

impl PolicyRegistry {
    pub fn seeded(now: DateTime<Utc>) -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(BASELINE_VERSION.to_string(), Policy::baseline(now));
        Self {
            current_policy_version: BASELINE_VERSION.to_string(),
            policies,
            history: Vec::new(),
        }
    }

    fn is_valid(&self) -> bool {
        !self.current_policy_version.trim().is_empty()
            && self.policies.iter().all(|(k, p)| *k == p.version)
    }

    fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Self>(text).ok().filter(|r| r.is_valid())
    }
}

fn ts_utc(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// File-backed registry operations.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    seed_path: PathBuf,
    repo_root: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>, seed_path: impl Into<PathBuf>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seed_path: seed_path.into(),
            repo_root: repo_root.into(),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(&cfg.registry_path, &cfg.registry_seed_path, &cfg.repo_root)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry, healing missing or corrupt state.
    ///
    /// Only an absent file or unparsable content is healed. Any other read
    /// error is returned and the file is left untouched.
    pub fn load(&self) -> Result<PolicyRegistry> {
        let primary = match fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read policy registry {:?}", self.path));
            }
        };
        if let Some(reg) = primary
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(PolicyRegistry::parse)
        {
            return Ok(reg);
        }
        let reason = if primary.is_some() { "registry_corrupt" } else { "registry_missing" };

        let (reg, source) = match fs::read_to_string(&self.seed_path)
            .ok()
            .as_deref()
            .and_then(PolicyRegistry::parse)
        {
            Some(seed) => (seed, "seed_file"),
            None => (PolicyRegistry::seeded(Utc::now()), "hardcoded_baseline"),
        };
        log(
            Level::Warn,
            Domain::Registry,
            "recovered",
            obj(&[
                ("reason", v_str(reason)),
                ("source", v_str(source)),
                ("path", v_str(&self.path.display().to_string())),
            ]),
        );
        self.persist(&reg)?;
        Ok(reg)
    }

    /// Resolve `version` (or the current one), falling back to `baseline`.
    pub fn get_policy(&self, version: Option<&str>) -> Result<Policy> {
        let reg = self.load()?;
        let wanted = version.unwrap_or(&reg.current_policy_version);
        let policy = reg
            .policies
            .get(wanted)
            .or_else(|| reg.policies.get(BASELINE_VERSION))
            .cloned()
            .unwrap_or_else(|| Policy::baseline(Utc::now()));
        Ok(policy)
    }

    pub fn upsert_policy<I, K>(
        &self,
        version: &str,
        overrides: I,
        based_on: Option<&str>,
        source: PolicySource,
        evidence: Option<&str>,
    ) -> Result<Policy>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if version.trim().is_empty() {
            bail!("policy version must not be empty");
        }
        let mut reg = self.load()?;
        let policy = Policy {
            version: version.to_string(),
            risk_overrides: RiskOverrides::filtered(overrides),
            created_ts_utc: ts_utc(Utc::now()),
            source,
            based_on: based_on.map(str::to_string),
            evidence: evidence.map(|e| self.normalize_evidence(e)),
        };
        reg.policies.insert(version.to_string(), policy.clone());
        self.persist(&reg)?;
        log(
            Level::Info,
            Domain::Registry,
            "upserted",
            obj(&[
                ("policy_version", v_str(version)),
                ("override_keys", serde_json::json!(policy.risk_overrides.keys().collect::<Vec<_>>())),
            ]),
        );
        Ok(policy)
    }

    /// Make `version` current and record the promotion. The version must exist.
    pub fn promote_policy(&self, version: &str, evidence: Option<&str>) -> Result<RegistryEvent> {
        let mut reg = self.load()?;
        if !reg.policies.contains_key(version) {
            bail!("cannot promote unknown policy version {}", version);
        }
        reg.current_policy_version = version.to_string();
        let event = self.record(&mut reg, RegistryAction::Promoted, version, evidence);
        self.persist(&reg)?;
        Ok(event)
    }

    /// Record a rejection; the current policy is unchanged.
    pub fn reject_policy(&self, version: &str, evidence: Option<&str>) -> Result<RegistryEvent> {
        let mut reg = self.load()?;
        let event = self.record(&mut reg, RegistryAction::Rejected, version, evidence);
        self.persist(&reg)?;
        Ok(event)
    }

    fn record(
        &self,
        reg: &mut PolicyRegistry,
        action: RegistryAction,
        version: &str,
        evidence: Option<&str>,
    ) -> RegistryEvent {
        let event = RegistryEvent {
            action,
            policy_version: version.to_string(),
            evidence: evidence.map(|e| self.normalize_evidence(e)),
            ts_utc: ts_utc(Utc::now()),
        };
        log_registry_event(action.as_str(), version, event.evidence.as_deref());
        reg.history.push(event.clone());
        event
    }

    fn persist(&self, reg: &PolicyRegistry) -> Result<()> {
        write_json_atomic(&self.path, reg)?;
        Ok(())
    }

    /// Repo-relative form of an evidence path that points inside the repo root.
    ///
    /// Relative paths are resolved against the working directory first.
    pub fn normalize_evidence(&self, evidence: &str) -> String {
        let p = Path::new(evidence);
        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(p),
                Err(_) => return evidence.to_string(),
            }
        };
        let root = self.repo_root.canonicalize().unwrap_or_else(|_| self.repo_root.clone());
        let full = full.canonicalize().unwrap_or(full);
        match full.strip_prefix(&root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            _ => evidence.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RegistryStore {
        RegistryStore::from_config(&PipelineConfig::rooted_at(dir.path()))
    }

    #[test]
    fn test_overrides_drop_unknown_and_non_numeric() {
        let o = RiskOverrides::filtered(vec![
            ("max_drawdown", json!(4.0)),
            ("leverage", json!(10.0)),
            ("cooldown_seconds", json!("soon")),
        ]);
        assert_eq!(o.len(), 1);
        assert_eq!(o.get("max_drawdown"), Some(4.0));
    }

    #[test]
    fn test_overrides_filtered_on_deserialize() {
        let o: RiskOverrides = serde_json::from_str(r#"{"max_turnover": 50, "yolo": 1}"#).unwrap();
        assert_eq!(o.get("max_turnover"), Some(50.0));
        assert_eq!(o.get("yolo"), None);
        assert_eq!(serde_json::to_string(&o).unwrap(), r#"{"max_turnover":50.0}"#);
    }

    #[test]
    fn test_missing_registry_is_seeded_and_persisted() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let reg = s.load().unwrap();
        assert_eq!(reg.current_policy_version, BASELINE_VERSION);
        assert!(reg.policies[BASELINE_VERSION].risk_overrides.is_empty());
        assert!(s.path().exists());
    }

    #[test]
    fn test_corrupt_registry_falls_back_to_seed_file() {
        let dir = TempDir::new().unwrap();
        let cfg = PipelineConfig::rooted_at(dir.path());
        fs::create_dir_all(cfg.registry_path.parent().unwrap()).unwrap();
        fs::write(&cfg.registry_path, "{ not json").unwrap();
        let seed = json!({
            "current_policy_version": "seed-v1",
            "policies": {"seed-v1": {
                "version": "seed-v1",
                "risk_overrides": {"max_drawdown": 3.0},
                "created_ts_utc": "2026-01-01T00:00:00.000Z",
                "source": "seed"
            }},
            "history": []
        });
        fs::write(&cfg.registry_seed_path, seed.to_string()).unwrap();
        let s = RegistryStore::from_config(&cfg);
        let reg = s.load().unwrap();
        assert_eq!(reg.current_policy_version, "seed-v1");
        // healed file now parses on its own
        let text = fs::read_to_string(&cfg.registry_path).unwrap();
        assert!(PolicyRegistry::parse(&text).is_some());
    }

    #[test]
    fn test_corrupt_registry_and_seed_fall_back_to_baseline() {
        let dir = TempDir::new().unwrap();
        let cfg = PipelineConfig::rooted_at(dir.path());
        fs::create_dir_all(cfg.registry_path.parent().unwrap()).unwrap();
        fs::write(&cfg.registry_path, "[]").unwrap();
        fs::write(&cfg.registry_seed_path, "{\"current_policy_version\": \"\"}").unwrap();
        let reg = RegistryStore::from_config(&cfg).load().unwrap();
        assert_eq!(reg.current_policy_version, BASELINE_VERSION);
        assert_eq!(reg.policies.len(), 1);
    }

    #[test]
    fn test_unreadable_registry_errors_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let cfg = PipelineConfig::rooted_at(dir.path());
        fs::create_dir_all(&cfg.registry_path).unwrap();
        let s = RegistryStore::from_config(&cfg);
        assert!(s.load().is_err());
        assert!(s.upsert_policy("v2", Vec::<(String, Value)>::new(), None, PolicySource::Manual, None).is_err());
        assert!(cfg.registry_path.is_dir());
        let names: Vec<_> = fs::read_dir(cfg.registry_path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["policy_registry.json".to_string()]);
    }

    #[test]
    fn test_non_utf8_registry_is_healed_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let cfg = PipelineConfig::rooted_at(dir.path());
        fs::create_dir_all(cfg.registry_path.parent().unwrap()).unwrap();
        fs::write(&cfg.registry_path, [0xff, 0xfe, 0x00]).unwrap();
        let reg = RegistryStore::from_config(&cfg).load().unwrap();
        assert_eq!(reg.current_policy_version, BASELINE_VERSION);
        let text = fs::read_to_string(&cfg.registry_path).unwrap();
        assert!(PolicyRegistry::parse(&text).is_some());
    }

    #[test]
    fn test_relative_evidence_resolved_against_working_dir() {
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        let (Some(parent), Some(name)) = (cwd.parent(), cwd.file_name()) else {
            return;
        };
        let s = RegistryStore::new("unused.json", "unused.seed.json", parent);
        assert_eq!(
            s.normalize_evidence("Cargo.toml"),
            format!("{}/Cargo.toml", name.to_string_lossy())
        );
    }

    #[test]
    fn test_unknown_version_falls_back_to_baseline() {
        let dir = TempDir::new().unwrap();
        let p = store(&dir).get_policy(Some("does-not-exist")).unwrap();
        assert_eq!(p.version, BASELINE_VERSION);
    }

    #[test]
    fn test_promote_updates_current_and_history() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.upsert_policy("v2", vec![("max_drawdown", json!(3.5))], Some("baseline"), PolicySource::Candidate, None)
            .unwrap();
        s.promote_policy("v2", Some("runs/promotion/r1/promotion_decision.json")).unwrap();
        let reg = s.load().unwrap();
        assert_eq!(reg.current_policy_version, "v2");
        assert_eq!(reg.history.len(), 1);
        assert_eq!(reg.history[0].action, RegistryAction::Promoted);
        assert_eq!(s.get_policy(None).unwrap().version, "v2");
    }

    #[test]
    fn test_promote_unknown_version_errors() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).promote_policy("ghost", None).is_err());
    }

    #[test]
    fn test_reject_keeps_current() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.reject_policy("cand-x", None).unwrap();
        let reg = s.load().unwrap();
        assert_eq!(reg.current_policy_version, BASELINE_VERSION);
        assert_eq!(reg.history[0].action, RegistryAction::Rejected);
        assert_eq!(reg.history[0].policy_version, "cand-x");
    }

    #[test]
    fn test_evidence_normalized_inside_repo() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let inside = dir.path().join("runs").join("stress").join("r1").join("stress_report.json");
        fs::create_dir_all(inside.parent().unwrap()).unwrap();
        fs::write(&inside, "{}").unwrap();
        assert_eq!(
            s.normalize_evidence(&inside.display().to_string()),
            "runs/stress/r1/stress_report.json"
        );
        assert_eq!(s.normalize_evidence("relative/path.json"), "relative/path.json");
        assert_eq!(s.normalize_evidence("/definitely/outside.json"), "/definitely/outside.json");
    }
}
