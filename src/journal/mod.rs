//! # Status Journal
//!
//! One JSON file per task, `<key>.status.json`, inside the run's working
//! directory. The entry is both the in-memory working state of a task and
//! the on-disk source of truth for crash recovery and post-hoc inspection.
//!
//! Reserved top-level keys:
//!
//! | key            | meaning                                             |
//! |----------------|-----------------------------------------------------|
//! | `name`         | the task key (equals the file's base name)          |
//! | `params`       | the task's parameters, frozen at first admission    |
//! | `E`            | structured output of executor `E`                   |
//! | `E_status`     | `SUCCESS`, `SKIPPED`, or `ERROR <kind>::<message>`  |
//! | `E_last_run`   | timestamp of the last actual (non-skipped) run      |
//!
//! Unknown top-level keys survive a load/save round trip untouched.
//!
//! Writes go through a temp file followed by a rename on the same
//! filesystem, so a concurrent reader sees either the old entry or the new
//! one in full, never partial JSON. Per-key write serialization is the
//! scheduler's job (one worker per key); the journal itself takes no locks.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Suffix of every journal file.
pub const STATUS_SUFFIX: &str = ".status.json";

/// Errors raised by journal I/O.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The file exists but its content is not valid JSON.
    #[error("journal for '{key}' is corrupt")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The entry could not be serialized.
    #[error("failed to encode journal for '{key}'")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-executor state recorded in a journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Skipped,
    /// Holds the detail after the `ERROR ` prefix, e.g.
    /// `RuntimeError::HTTP response 500`.
    Error(String),
}

impl ExecStatus {
    /// Parses the journal string form. Returns `None` for anything that is
    /// not a status value this engine writes.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SUCCESS" => Some(Self::Success),
            "SKIPPED" => Some(Self::Skipped),
            other => other
                .strip_prefix("ERROR ")
                .map(|detail| Self::Error(detail.to_string())),
        }
    }

    /// True for `SUCCESS` and `SKIPPED`, the two settled-good states.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Skipped => f.write_str("SKIPPED"),
            Self::Error(detail) => write!(f, "ERROR {detail}"),
        }
    }
}

/// One task's journal entry.
///
/// A thin wrapper over the raw JSON object: executors store heterogeneous
/// output, so values stay dynamic and the engine only interprets the
/// reserved keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusData {
    fields: Map<String, Value>,
}

impl StatusData {
    /// Fresh entry for a newly admitted task.
    pub fn new(key: &str, params: Map<String, Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(key.to_string()));
        fields.insert("params".to_string(), Value::Object(params));
        Self { fields }
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Map<String, Value>> {
        self.fields.get("params").and_then(Value::as_object)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// State of executor `name` for this task, if it ever ran.
    pub fn executor_status(&self, name: &str) -> Option<ExecStatus> {
        self.fields
            .get(&format!("{name}_status"))
            .and_then(Value::as_str)
            .and_then(ExecStatus::parse)
    }

    pub fn set_executor_status(&mut self, name: &str, status: &ExecStatus) {
        self.fields
            .insert(format!("{name}_status"), Value::String(status.to_string()));
    }

    /// Stores executor output under its own name.
    pub fn record_result(&mut self, name: &str, patch: Value) {
        self.fields.insert(name.to_string(), patch);
    }

    pub fn stamp_last_run(&mut self, name: &str, timestamp: String) {
        self.fields
            .insert(format!("{name}_last_run"), Value::String(timestamp));
    }

    pub fn last_run(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&format!("{name}_last_run"))
            .and_then(Value::as_str)
    }

    /// True when every named executor settled in `SUCCESS` or `SKIPPED`.
    pub fn is_complete<'a>(&self, executors: impl IntoIterator<Item = &'a str>) -> bool {
        executors
            .into_iter()
            .all(|name| self.executor_status(name).is_some_and(|s| s.is_ok()))
    }
}

/// Journal timestamp: microsecond-resolution UTC, e.g.
/// `2022-08-05 16:03:52.336815`.
pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Path of the journal file for `key` inside `dir`.
pub fn journal_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}{STATUS_SUFFIX}"))
}

/// Loads the entry for `key`, or `None` when the file does not exist.
pub fn load(dir: &Path, key: &str) -> Result<Option<StatusData>, JournalError> {
    let path = journal_path(dir, key);
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&path)?;
    let status = serde_json::from_str(&raw).map_err(|source| JournalError::Corrupt {
        key: key.to_string(),
        source,
    })?;
    Ok(Some(status))
}

/// Persists the entry for `key` atomically (write temp, then rename).
pub fn save(dir: &Path, key: &str, status: &StatusData) -> Result<(), JournalError> {
    let json = serde_json::to_string_pretty(status).map_err(|source| JournalError::Encode {
        key: key.to_string(),
        source,
    })?;

    let path = journal_path(dir, key);
    let tmp = dir.join(format!("{key}{STATUS_SUFFIX}.tmp"));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Result of scanning a journal directory.
#[derive(Debug, Default)]
pub struct Scan {
    /// Entries that parsed, ordered by task name.
    pub entries: Vec<StatusData>,
    /// Files that exist but did not parse, with the parse error text.
    pub corrupt: Vec<(PathBuf, String)>,
}

/// Loads every `*.status.json` entry in `dir`.
///
/// Corrupt files are reported in the result (and logged), not silently
/// skipped.
pub fn scan(dir: &Path) -> Result<Scan, JournalError> {
    let mut scan = Scan::default();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(key) = name.strip_suffix(STATUS_SUFFIX) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }

        match load(dir, key) {
            Ok(Some(status)) => scan.entries.push(status),
            Ok(None) => {}
            Err(JournalError::Corrupt { key, source }) => {
                warn!(key = %key, error = %source, "corrupt journal entry");
                scan.corrupt.push((entry.path(), source.to_string()));
            }
            Err(err) => return Err(err),
        }
    }

    scan.entries
        .sort_by(|a, b| a.name().unwrap_or("").cmp(b.name().unwrap_or("")));
    Ok(scan)
}
