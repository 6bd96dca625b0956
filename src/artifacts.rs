//! Durable artifact I/O.
//!
//! ## Files Written
//! - `<runs_root>/<tool>/<run_id>/<name>` - primary artifact
//! - `<runs_root>/<tool>_latest/<stem>_latest.<ext>` - mirror for downstream readers
//!
//! All primary writes go through a temp file in the target directory followed
//! by an atomic rename, so readers never observe a partial file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::logging::{log, log_artifact, obj, ts_epoch_ms, v_str, Domain, Level};

/// Path and digest of one written artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub sha256: String,
}

/// Compute SHA-256 hash of bytes, returning lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes to a file atomically (temp file + rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("failed to create directory {:?}", parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, process::id()));
    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create temp file {:?}", temp_path))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file {:?}", temp_path))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file {:?}", temp_path))?;
    }
    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to rename {:?} to {:?}", temp_path, path))?;
    Ok(())
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<ArtifactRecord> {
    let mut bytes = serde_json::to_vec_pretty(value).context("failed to serialize artifact")?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)?;
    Ok(record(path, &bytes))
}

/// One compact JSON object per line, written atomically.
pub fn write_jsonl_atomic<T: Serialize>(path: &Path, rows: &[T]) -> Result<ArtifactRecord> {
    let mut bytes = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut bytes, row).context("failed to serialize jsonl row")?;
        bytes.push(b'\n');
    }
    write_atomic(path, &bytes)?;
    Ok(record(path, &bytes))
}

fn record(path: &Path, bytes: &[u8]) -> ArtifactRecord {
    let sha256 = sha256_hex(bytes);
    let path = path.display().to_string();
    log_artifact(&path, &sha256, bytes.len());
    ArtifactRecord { path, sha256 }
}

/// Append one line to a JSONL log (creating it if needed).
///
/// A torn last line (no trailing newline) is terminated first so the new row
/// starts on a line of its own.
pub fn append_jsonl<T: Serialize>(path: &Path, row: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("failed to create directory {:?}", parent))?;
    }
    let mut bytes = serde_json::to_vec(row).context("failed to serialize jsonl row")?;
    bytes.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {:?} for append", path))?;
    if ends_mid_line(&mut file).with_context(|| format!("failed to inspect tail of {:?}", path))? {
        log(
            Level::Warn,
            Domain::Artifacts,
            "jsonl_torn_line_terminated",
            obj(&[("path", v_str(&path.display().to_string()))]),
        );
        bytes.insert(0, b'\n');
    }
    file.write_all(&bytes)
        .with_context(|| format!("failed to append to {:?}", path))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {:?}", path))?;
    Ok(())
}

/// True when the file is non-empty and its last byte is not a newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Read a JSONL file, skipping lines that do not parse.
///
/// Returns the parsed rows and the number of skipped lines. A missing file is
/// an empty log.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> (Vec<T>, usize) {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return (Vec::new(), 0),
    };
    let mut rows = Vec::new();
    let mut skipped = 0;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            skipped += 1;
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(row) => rows.push(row),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        log(
            Level::Warn,
            Domain::Artifacts,
            "jsonl_lines_skipped",
            obj(&[("path", v_str(&path.display().to_string())), ("skipped", skipped.into())]),
        );
    }
    (rows, skipped)
}

pub fn run_dir(runs_root: &Path, tool: &str, run_id: &str) -> PathBuf {
    runs_root.join(tool).join(run_id)
}

/// `<runs_root>/<tool>_latest/<stem>_latest.<ext>`
pub fn latest_path(runs_root: &Path, tool: &str, file_name: &str) -> PathBuf {
    let p = Path::new(file_name);
    let stem = p.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match p.extension() {
        Some(ext) => format!("{}_latest.{}", stem, ext.to_string_lossy()),
        None => format!("{}_latest", stem),
    };
    runs_root.join(format!("{}_latest", tool)).join(name)
}

/// Copy a written artifact into its `_latest` location.
pub fn mirror_latest(src: &Path, runs_root: &Path, tool: &str) -> Result<ArtifactRecord> {
    let bytes = fs::read(src).with_context(|| format!("failed to read {:?} for mirroring", src))?;
    let file_name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = latest_path(runs_root, tool, &file_name);
    write_atomic(&dest, &bytes)?;
    Ok(record(&dest, &bytes))
}

/// Time-ordered run id: `<prefix>-<epoch_ms>-<pid>`.
pub fn new_run_id(prefix: &str) -> String {
    format!("{}-{}-{}", prefix, ts_epoch_ms(), process::id())
}

/// Outcome of reading an optional evidence artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence<T> {
    Present(T),
    Missing,
    Invalid(String),
}

impl<T> Evidence<T> {
    pub fn status_label(&self) -> &'static str {
        match self {
            Evidence::Present(_) => "PRESENT",
            Evidence::Missing => "MISSING",
            Evidence::Invalid(_) => "INVALID",
        }
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            Evidence::Present(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> From<Option<T>> for Evidence<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Evidence::Present(v),
            None => Evidence::Missing,
        }
    }
}

/// Read a JSON artifact without ever failing past this boundary.
pub fn load_evidence<T: DeserializeOwned>(path: Option<&Path>) -> Evidence<T> {
    let Some(path) = path else {
        return Evidence::Missing;
    };
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Evidence::Missing,
        Err(err) => return Evidence::Invalid(format!("read error: {}", err)),
    };
    if text.trim().is_empty() {
        return Evidence::Invalid("empty file".to_string());
    }
    match serde_json::from_str::<T>(&text) {
        Ok(v) => Evidence::Present(v),
        Err(err) => Evidence::Invalid(format!("parse error: {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("a.json");
        write_json_atomic(&path, &json!({"k": 1})).unwrap();
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json".to_string()]);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_record_sha_matches_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        let rec = write_jsonl_atomic(&path, &[json!({"a": 1}), json!({"a": 2})]).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(rec.sha256, sha256_hex(&bytes));
        assert_eq!(sha256_hex(b"").len(), 64);
    }

    #[test]
    fn test_latest_path_suffix() {
        let p = latest_path(Path::new("/r"), "stress", "stress_report.json");
        assert_eq!(p, PathBuf::from("/r/stress_latest/stress_report_latest.json"));
        let p = latest_path(Path::new("/r"), "wf", "windows.jsonl");
        assert_eq!(p, PathBuf::from("/r/wf_latest/windows_latest.jsonl"));
    }

    #[test]
    fn test_mirror_copies_bytes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tool").join("r1").join("x.json");
        let rec = write_json_atomic(&src, &json!({"v": 3})).unwrap();
        let mirror = mirror_latest(&src, dir.path(), "tool").unwrap();
        assert_eq!(rec.sha256, mirror.sha256);
        assert!(dir.path().join("tool_latest").join("x_latest.json").exists());
    }

    #[test]
    fn test_read_jsonl_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &json!({"n": 1})).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{not json\n\n").unwrap();
        append_jsonl(&path, &json!({"n": 2})).unwrap();
        let (rows, skipped): (Vec<Value>, usize) = read_jsonl(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_append_after_torn_line_starts_fresh_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &json!({"n": 1})).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"n\": 2, \"cut").unwrap();
        append_jsonl(&path, &json!({"n": 3})).unwrap();

        let (rows, skipped): (Vec<Value>, usize) = read_jsonl(&path);
        assert_eq!(rows, vec![json!({"n": 1}), json!({"n": 3})]);
        assert_eq!(skipped, 1);
        assert!(fs::read_to_string(&path).unwrap().ends_with("{\"n\":3}\n"));
    }

    #[test]
    fn test_append_to_empty_file_adds_no_blank_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "").unwrap();
        append_jsonl(&path, &json!({"n": 1})).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"n\":1}\n");
    }

    #[test]
    fn test_load_evidence_states() {
        let dir = TempDir::new().unwrap();
        let missing: Evidence<Value> = load_evidence(Some(&dir.path().join("nope.json")));
        assert_eq!(missing, Evidence::Missing);
        let none: Evidence<Value> = load_evidence(None);
        assert_eq!(none, Evidence::Missing);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ truncated").unwrap();
        let invalid: Evidence<Value> = load_evidence(Some(&bad));
        assert_eq!(invalid.status_label(), "INVALID");

        let good = dir.path().join("good.json");
        fs::write(&good, "{\"status\": \"PASS\"}").unwrap();
        let present: Evidence<Value> = load_evidence(Some(&good));
        assert_eq!(present.present().unwrap()["status"], "PASS");
    }
}
