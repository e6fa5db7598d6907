//! Turns a remote listing into an ordered list of work.
//!
//! Planning is pure: it reads the listing, the rules and a state snapshot,
//! and touches neither the filesystem nor the network.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::Path;

use super::classifier::{classify, is_native_document, is_unsupported_native};
use super::models::{RemoteFile, WorkItem};
use super::organizer::{clean_filename, export_file_name, resolve_path, select_timestamp};
use crate::config::AppConfig;
use crate::db::StateSnapshot;

/// Eligibility rules for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rules {
    pub min_size_bytes: u64,
    pub modified_before: Option<NaiveDate>,
    pub include_native_docs: bool,
}

impl Rules {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_size_bytes: config.min_size_bytes(),
            modified_before: config.modified_before,
            include_native_docs: config.include_native_docs,
        }
    }
}

/// Why a listed file was left out. Rules are checked in declaration order
/// and the first failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    NotOwned,
    NotInPrimaryDrive,
    UnsupportedType,
    NativeDocsExcluded,
    BelowMinimumSize,
    ModifiedTooRecently,
    AlreadyArchived,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotOwned => "not owned by you",
            Self::NotInPrimaryDrive => "shared or in a shared drive",
            Self::UnsupportedType => "type cannot be downloaded",
            Self::NativeDocsExcluded => "native document (exports not enabled)",
            Self::BelowMinimumSize => "below minimum size",
            Self::ModifiedTooRecently => "modified too recently",
            Self::AlreadyArchived => "already archived",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub remote_id: String,
    pub name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub items: Vec<WorkItem>,
    pub skipped: Vec<SkippedFile>,
}

pub fn plan(
    files: &[RemoteFile],
    rules: &Rules,
    snapshot: &StateSnapshot,
    archive_root: &Path,
    run_started: DateTime<Utc>,
) -> Plan {
    let mut result = Plan::default();

    for file in files {
        match check(file, rules, snapshot) {
            Some(reason) => result.skipped.push(SkippedFile {
                remote_id: file.id.clone(),
                name: file.name.clone(),
                reason,
            }),
            None => result
                .items
                .push(work_item(file, snapshot, archive_root, run_started)),
        }
    }

    result.items.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
    result.skipped.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
    result
}

fn check(file: &RemoteFile, rules: &Rules, snapshot: &StateSnapshot) -> Option<SkipReason> {
    if !file.owned_by_me {
        return Some(SkipReason::NotOwned);
    }
    if !file.in_primary_drive {
        return Some(SkipReason::NotInPrimaryDrive);
    }
    if is_unsupported_native(&file.mime_type) {
        return Some(SkipReason::UnsupportedType);
    }

    // Native documents report size 0, so the size rule does not apply
    if is_native_document(&file.mime_type) {
        if !rules.include_native_docs {
            return Some(SkipReason::NativeDocsExcluded);
        }
    } else if file.size < rules.min_size_bytes {
        return Some(SkipReason::BelowMinimumSize);
    }

    // Files without a modification time are not held back
    if let Some(cutoff) = rules.modified_before {
        if file
            .modified_time
            .is_some_and(|ts| ts.date_naive() >= cutoff)
        {
            return Some(SkipReason::ModifiedTooRecently);
        }
    }

    if snapshot.is_archived(&file.id) {
        return Some(SkipReason::AlreadyArchived);
    }

    None
}

fn work_item(
    file: &RemoteFile,
    snapshot: &StateSnapshot,
    archive_root: &Path,
    run_started: DateTime<Utc>,
) -> WorkItem {
    let classification = classify(&file.name, &file.mime_type);
    let cleaned = clean_filename(&file.name);
    let file_name = match &classification.export {
        Some(export) => export_file_name(&cleaned, export),
        None => cleaned,
    };

    let (timestamp, timestamp_source) =
        select_timestamp(file.modified_time, file.created_time, run_started);
    let destination = resolve_path(archive_root, classification.category, timestamp, &file_name);

    // Exports have no remote size to check against
    let expected_size = match classification.export {
        Some(_) => None,
        None => Some(file.size),
    };

    WorkItem {
        remote_id: file.id.clone(),
        name: file.name.clone(),
        expected_size,
        mime_type: file.mime_type.clone(),
        category: classification.category,
        export: classification.export,
        destination,
        timestamp,
        timestamp_source,
        resume: snapshot.pending_local_copy(&file.id).cloned(),
        modified_time: file.modified_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Category, TimestampSource};
    use chrono::TimeZone;
    use std::path::PathBuf;

    const MB: u64 = 1024 * 1024;

    fn file(id: &str, name: &str, size: u64) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            name: name.to_string(),
            size,
            mime_type: String::new(),
            owned_by_me: true,
            in_primary_drive: true,
            modified_time: Some(Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap()),
            created_time: None,
        }
    }

    fn rules(min_mb: u64) -> Rules {
        Rules {
            min_size_bytes: min_mb * MB,
            modified_before: None,
            include_native_docs: false,
        }
    }

    fn run_started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_large_photo_is_planned_into_dated_folder() {
        let files = vec![file("f1", "trip.jpg", 300 * MB)];
        let plan = plan(
            &files,
            &rules(200),
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        assert_eq!(plan.items.len(), 1);
        let item = &plan.items[0];
        assert_eq!(item.category, Category::Photo);
        assert_eq!(
            item.destination,
            PathBuf::from("/archive/Photos/2025/2025-06/trip.jpg")
        );
        assert_eq!(item.expected_size, Some(300 * MB));
        assert_eq!(item.timestamp_source, TimestampSource::Modified);
        assert!(item.resume.is_none());
    }

    #[test]
    fn test_threshold_excludes_smaller_files() {
        let files = vec![file("f1", "trip.jpg", 300 * MB)];
        let plan = plan(
            &files,
            &rules(500),
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        assert!(plan.items.is_empty());
        assert_eq!(plan.skipped[0].reason, SkipReason::BelowMinimumSize);
    }

    #[test]
    fn test_first_failing_rule_wins() {
        let mut shared = file("a", "shared.mp4", 10);
        shared.in_primary_drive = false;
        let mut foreign = file("b", "foreign.mp4", 10);
        foreign.owned_by_me = false;
        foreign.in_primary_drive = false;
        let mut folder = file("c", "Holiday", 0);
        folder.mime_type = "application/vnd.google-apps.folder".to_string();

        let plan = plan(
            &[shared, foreign, folder],
            &rules(1),
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        let reasons: Vec<_> = plan.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::NotInPrimaryDrive,
                SkipReason::NotOwned,
                SkipReason::UnsupportedType
            ]
        );
    }

    #[test]
    fn test_already_archived_is_skipped_but_trash_pending_resumes() {
        let files = vec![file("done", "a.mp4", MB), file("half", "b.mp4", MB)];
        let mut snapshot = StateSnapshot::default();
        snapshot.archived.insert("done".to_string());
        snapshot
            .trash_pending
            .insert("half".to_string(), PathBuf::from("/archive/Videos/2025/2025-06/b.mp4"));

        let plan = plan(&files, &rules(0), &snapshot, Path::new("/archive"), run_started());

        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].remote_id, "half");
        assert_eq!(
            plan.items[0].resume,
            Some(PathBuf::from("/archive/Videos/2025/2025-06/b.mp4"))
        );
        assert_eq!(plan.skipped[0].reason, SkipReason::AlreadyArchived);
    }

    #[test]
    fn test_native_documents_export_and_bypass_size_when_enabled() {
        let mut doc = file("d1", "Budget: 2025", 0);
        doc.mime_type = "application/vnd.google-apps.spreadsheet".to_string();

        let excluded = plan(
            std::slice::from_ref(&doc),
            &rules(200),
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );
        assert!(excluded.items.is_empty());
        assert_eq!(excluded.skipped[0].reason, SkipReason::NativeDocsExcluded);

        let included = plan(
            &[doc],
            &Rules {
                include_native_docs: true,
                ..rules(200)
            },
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );
        let item = &included.items[0];
        assert_eq!(item.expected_size, None);
        assert_eq!(item.export.as_ref().unwrap().extension, ".xlsx");
        assert_eq!(
            item.destination,
            PathBuf::from("/archive/Documents/2025/2025-06/Budget_ 2025.xlsx")
        );
    }

    #[test]
    fn test_native_documents_excluded_without_flag_even_at_zero_minimum() {
        let mut doc = file("d1", "Notes", 0);
        doc.mime_type = "application/vnd.google-apps.document".to_string();
        let photo = file("p1", "empty.jpg", 0);

        let plan = plan(
            &[doc, photo],
            &rules(0),
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        let ids: Vec<_> = plan.items.iter().map(|i| i.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["p1"]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].remote_id, "d1");
        assert_eq!(plan.skipped[0].reason, SkipReason::NativeDocsExcluded);
    }

    #[test]
    fn test_modified_before_ignores_creation_time() {
        let mut undated = file("u", "undated.mkv", MB);
        undated.modified_time = None;
        undated.created_time = Some(Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());

        let plan = plan(
            &[undated],
            &Rules {
                modified_before: NaiveDate::from_ymd_opt(2025, 7, 1),
                ..rules(0)
            },
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        assert_eq!(plan.items.len(), 1);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_modified_before_cutoff() {
        let old = file("old", "old.mkv", MB);
        let mut recent = file("new", "new.mkv", MB);
        recent.modified_time = Some(Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());

        let plan = plan(
            &[old, recent],
            &Rules {
                modified_before: NaiveDate::from_ymd_opt(2025, 7, 1),
                ..rules(0)
            },
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].remote_id, "old");
        assert_eq!(plan.skipped[0].reason, SkipReason::ModifiedTooRecently);
    }

    #[test]
    fn test_items_sorted_by_id_and_plan_is_deterministic() {
        let files = vec![
            file("c", "c.zip", MB),
            file("a", "a.zip", MB),
            file("b", "b.zip", MB),
        ];
        let snapshot = StateSnapshot::default();

        let first = plan(&files, &rules(0), &snapshot, Path::new("/archive"), run_started());
        let second = plan(&files, &rules(0), &snapshot, Path::new("/archive"), run_started());

        let ids: Vec<_> = first.items.iter().map(|i| i.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_dates_fall_back_to_run_start() {
        let mut undated = file("u", "clip.mp4", MB);
        undated.modified_time = None;

        let plan = plan(
            &[undated],
            &rules(0),
            &StateSnapshot::default(),
            Path::new("/archive"),
            run_started(),
        );

        let item = &plan.items[0];
        assert_eq!(item.timestamp_source, TimestampSource::RunStarted);
        assert_eq!(
            item.destination,
            PathBuf::from("/archive/Videos/2026/2026-01/clip.mp4")
        );
    }
}
