//! # Journal Reports
//!
//! Pure functions over a directory of journal entries: a tabular dump of
//! every task's per-executor status, and a histogram of statuses per
//! executor. Corrupt journal files are surfaced in both, never silently
//! dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::journal::{self, JournalError, StatusData};

/// executor name → status bucket → count.
pub type Histogram = BTreeMap<String, BTreeMap<String, usize>>;

/// Executor names appearing in an entry, derived from its `*_status` keys.
fn executor_names(status: &StatusData) -> Vec<String> {
    status
        .keys()
        .filter_map(|key| key.strip_suffix("_status"))
        .map(str::to_string)
        .collect()
}

/// Collapses `ERROR <kind>::<detail>` to `ERROR <kind>` so transient
/// message text does not fragment histogram buckets.
fn status_bucket(raw: &str) -> String {
    match raw.strip_prefix("ERROR ") {
        Some(detail) => {
            let kind = detail.split("::").next().unwrap_or(detail);
            format!("ERROR {kind}")
        }
        None => raw.to_string(),
    }
}

/// Renders every journal entry in `dir` as an aligned text table, one row
/// per task and one column per executor seen anywhere in the directory.
pub fn dump_table(dir: &Path) -> Result<String, JournalError> {
    let scan = journal::scan(dir)?;

    let mut executors = BTreeSet::new();
    for entry in &scan.entries {
        executors.extend(executor_names(entry));
    }

    let mut header = vec!["name".to_string()];
    header.extend(executors.iter().cloned());

    let mut rows = vec![header];
    for entry in &scan.entries {
        let mut row = vec![entry.name().unwrap_or("?").to_string()];
        for executor in &executors {
            let cell = entry
                .get(&format!("{executor}_status"))
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            row.push(cell.to_string());
        }
        rows.push(row);
    }

    let columns = rows[0].len();
    let mut widths = vec![0usize; columns];
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{cell:<width$}", width = widths[i]))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }

    for (path, error) in &scan.corrupt {
        out.push_str(&format!("corrupt: {} ({error})\n", path.display()));
    }

    Ok(out)
}

/// Counts journal statuses per executor across `dir`.
///
/// Also returns the corrupt files found during the scan so callers can
/// report them.
pub fn status_histogram(dir: &Path) -> Result<(Histogram, Vec<String>), JournalError> {
    let scan = journal::scan(dir)?;

    let mut histogram = Histogram::new();
    for entry in &scan.entries {
        for executor in executor_names(entry) {
            let Some(raw) = entry
                .get(&format!("{executor}_status"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            *histogram
                .entry(executor)
                .or_default()
                .entry(status_bucket(raw))
                .or_default() += 1;
        }
    }

    let corrupt = scan
        .corrupt
        .into_iter()
        .map(|(path, error)| format!("{} ({error})", path.display()))
        .collect();
    Ok((histogram, corrupt))
}
