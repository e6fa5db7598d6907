//! Local archive layout.
//!
//! ```text
//! <root>/Photos/YYYY/YYYY-MM/<name>
//! <root>/Videos/YYYY/YYYY-MM/<name>
//! <root>/Documents/YYYY/YYYY-MM/<name>
//! <root>/Audio/<name>
//! <root>/Archives/<name>
//! <root>/Installers/<name>
//! <root>/Other/<name>
//! ```

use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};

use super::models::{Category, ExportSpec, TimestampSource};

/// Characters not allowed in file names on common filesystems.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub fn resolve_path(
    archive_root: &Path,
    category: Category,
    timestamp: DateTime<Utc>,
    file_name: &str,
) -> PathBuf {
    let base = archive_root.join(category.folder_name());
    if category.is_date_partitioned() {
        let year = timestamp.year();
        base.join(format!("{:04}", year))
            .join(format!("{:04}-{:02}", year, timestamp.month()))
            .join(file_name)
    } else {
        base.join(file_name)
    }
}

/// Prefer modified time, then created time, then the run start. Never fails.
pub fn select_timestamp(
    modified: Option<DateTime<Utc>>,
    created: Option<DateTime<Utc>>,
    run_started: DateTime<Utc>,
) -> (DateTime<Utc>, TimestampSource) {
    if let Some(ts) = modified.filter(is_valid_timestamp) {
        return (ts, TimestampSource::Modified);
    }
    if let Some(ts) = created.filter(is_valid_timestamp) {
        return (ts, TimestampSource::Created);
    }
    (run_started, TimestampSource::RunStarted)
}

/// Remote stores report unset dates as the epoch.
fn is_valid_timestamp(ts: &DateTime<Utc>) -> bool {
    ts.timestamp() > 0
}

/// Make a remote name safe to use as a local file name.
pub fn clean_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Name of the exported copy of a native document: the export extension
/// replaces whatever extension the remote name carried.
pub fn export_file_name(name: &str, export: &ExportSpec) -> String {
    let (stem, _) = split_extension(name);
    format!("{}{}", stem, export.extension)
}

/// `trip.jpg` -> `trip(n).jpg`; extensionless names get the suffix appended.
pub fn disambiguate(path: &Path, n: u32) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = split_extension(&file_name);
    path.with_file_name(format!("{}({}){}", stem, n, ext))
}

/// `path`, then `path(1)`, `path(2)`, ... in the order collisions are tried.
pub fn candidates(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    std::iter::once(path.to_path_buf()).chain((1..).map(move |n| disambiguate(path, n)))
}

/// First of `path`, `path(1)`, `path(2)`, ... that does not exist on disk.
/// Read-only.
pub fn unique_path(path: &Path) -> PathBuf {
    candidates(path)
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Split into stem and extension (with dot). Dotfiles have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}
