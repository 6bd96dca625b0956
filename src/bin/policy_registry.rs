//! Inspect and mutate the policy registry.
//!
//! Usage:
//!   policy_registry show [VERSION]
//!   policy_registry upsert VERSION [--overrides JSON] [--based-on V] [--source seed|candidate|manual] [--evidence PATH]
//!   policy_registry promote VERSION [--evidence PATH]
//!   policy_registry reject VERSION [--evidence PATH]
//!
//! `show` dumps the policy JSON to stderr. `--registry FILE` overrides the
//! registry location. Exit: 0 ok, 2 error.

use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use policygate::cli::{exit, Args, EXIT_ERROR, EXIT_PASS};
use policygate::config::PipelineConfig;
use policygate::logging::{log, obj, summary_line, v_str, Domain, Level};
use policygate::registry::{PolicySource, RegistryStore};

const TOOL: &str = "policy_registry";

fn main() -> ExitCode {
    let args = Args::from_env();
    match run(&args) {
        Ok(pairs) => {
            println!("{}", summary_line(TOOL, &pairs));
            exit(EXIT_PASS)
        }
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

fn run(args: &Args) -> Result<Vec<(&'static str, String)>> {
    let mut pipeline = PipelineConfig::from_env();
    if let Some(path) = args.path("--registry") {
        pipeline.registry_path = path;
    }
    let store = RegistryStore::from_config(&pipeline);

    let positional = args.positional(&[]);
    let cmd = positional.first().copied().unwrap_or("show");
    let version = positional.get(1).copied();
    let evidence = args.value("--evidence");

    match cmd {
        "show" => {
            let reg = store.load()?;
            let policy = store.get_policy(version)?;
            eprintln!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(vec![
                ("status", "OK".to_string()),
                ("command", "show".to_string()),
                ("current_policy_version", reg.current_policy_version),
                ("policy_version", policy.version),
                ("policies", reg.policies.len().to_string()),
                ("history", reg.history.len().to_string()),
            ])
        }
        "upsert" => {
            let version = version.ok_or_else(|| anyhow!("upsert requires a VERSION"))?;
            let overrides: BTreeMap<String, Value> = match args.value("--overrides") {
                Some(raw) => serde_json::from_str(raw).context("--overrides must be a JSON object")?,
                None => BTreeMap::new(),
            };
            let source = match args.value("--source") {
                Some(s) => PolicySource::parse(s).ok_or_else(|| anyhow!("unknown source {}", s))?,
                None => PolicySource::Manual,
            };
            let policy = store.upsert_policy(version, overrides, args.value("--based-on"), source, evidence)?;
            Ok(vec![
                ("status", "OK".to_string()),
                ("command", "upsert".to_string()),
                ("policy_version", policy.version),
                ("override_keys", policy.risk_overrides.keys().cloned().collect::<Vec<_>>().join(",")),
            ])
        }
        "promote" | "reject" => {
            let version = version.ok_or_else(|| anyhow!("{} requires a VERSION", cmd))?;
            let event = if cmd == "promote" {
                store.promote_policy(version, evidence)?
            } else {
                store.reject_policy(version, evidence)?
            };
            Ok(vec![
                ("status", "OK".to_string()),
                ("command", cmd.to_string()),
                ("action", event.action.as_str().to_string()),
                ("policy_version", event.policy_version),
            ])
        }
        other => bail!("unknown command {} (expected show, upsert, promote, reject)", other),
    }
}
