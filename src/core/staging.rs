//! Local filesystem side of the executor.
//!
//! Downloads land in `<root>/.staging/<uuid>.part` and only reach the archive
//! tree after verification, through a hard link that never replaces an
//! existing file. A partially written file is never visible at its final path.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use super::organizer::{candidates, unique_path};
use super::verifier::{VerifiedFile, hash_file_sync};
use crate::error::{ArchiveError, FatalKind};

const STAGING_DIR: &str = ".staging";

/// Buffer size for staging writes (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Where a verified file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub path: PathBuf,
    /// An identical file was already at `path`; the staged copy was dropped.
    pub reused: bool,
}

#[derive(Clone)]
pub struct StagingArea {
    root: PathBuf,
    dir: PathBuf,
    /// Collision resolution plus linking must not interleave between workers.
    placement_lock: Arc<Mutex<()>>,
}

impl StagingArea {
    pub fn new(archive_root: &Path) -> Self {
        Self {
            root: archive_root.to_path_buf(),
            dir: archive_root.join(STAGING_DIR),
            placement_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Fresh, unique staging path. Nothing is created yet.
    pub fn new_path(&self) -> PathBuf {
        self.dir.join(format!("{}.part", Uuid::now_v7()))
    }

    /// Open `path` for writing, truncating anything a previous attempt left.
    pub async fn open(&self, path: &Path) -> Result<StagingWriter, ArchiveError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ArchiveError::from_io("create staging directory", &e))?;
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| ArchiveError::from_io("create staging file", &e))?;
        Ok(StagingWriter {
            file: BufWriter::with_capacity(BUFFER_SIZE, file),
            written: 0,
        })
    }

    /// Bytes available to this user on the archive volume.
    pub fn free_space(&self) -> Result<u64, ArchiveError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| ArchiveError::from_io("create archive root", &e))?;
        let stat = nix::sys::statvfs::statvfs(&self.root).map_err(|errno| {
            ArchiveError::from_io("query free space", &std::io::Error::from(errno))
        })?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }

    /// Move a verified staged file to `destination`, or the first free
    /// `name(n).ext` variant of it. A candidate that already holds identical
    /// content (size and hash) is reused instead.
    pub async fn place(
        &self,
        staged: &VerifiedFile,
        destination: &Path,
        modified_time: Option<DateTime<Utc>>,
    ) -> Result<Placement, ArchiveError> {
        let staged = staged.clone();
        let destination = destination.to_path_buf();
        let lock = self.placement_lock.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            place_sync(&staged, &destination, modified_time)
        })
        .await
        .map_err(|e| ArchiveError::fatal(FatalKind::Filesystem, e.to_string()))?
    }

    /// Where `place` would put a file of `expected_size` given what is on
    /// disk now. Nothing is written.
    ///
    /// Content cannot be hashed before it is downloaded, so an existing file
    /// of the same size stands in for the identical copy `place` would
    /// reuse. Without a known size the first free name is reported.
    pub fn preview(&self, destination: &Path, expected_size: Option<u64>) -> PathBuf {
        let Some(size) = expected_size else {
            return unique_path(destination);
        };
        candidates(destination)
            .find(|candidate| vacant(candidate) || is_file_of_size(candidate, size))
            .unwrap_or_else(|| unique_path(destination))
    }

    /// Best-effort removal of a staging file.
    pub async fn discard(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(file = %path.display(), "Discarded staging file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove staging file"),
        }
    }
}

fn place_sync(
    staged: &VerifiedFile,
    destination: &Path,
    modified_time: Option<DateTime<Utc>>,
) -> Result<Placement, ArchiveError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ArchiveError::from_io("create destination directory", &e))?;
    }

    for candidate in candidates(destination) {
        match claim(&staged.path, &candidate) {
            Ok(()) => {
                if let Some(mtime) = modified_time {
                    set_mtime(&candidate, mtime);
                }
                return Ok(Placement {
                    path: candidate,
                    reused: false,
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_file_of_size(&candidate, staged.size) && same_content(&candidate, staged) {
                    if let Err(e) = fs::remove_file(&staged.path) {
                        warn!(file = %staged.path.display(), error = %e, "Failed to remove staging file");
                    }
                    return Ok(Placement {
                        path: candidate,
                        reused: true,
                    });
                }
            }
            Err(e) => return Err(ArchiveError::from_io("move into archive", &e)),
        }
    }

    Err(ArchiveError::fatal(
        FatalKind::Filesystem,
        format!("no free name left for {}", destination.display()),
    ))
}

/// Give the staged file the name `candidate`, failing with `AlreadyExists`
/// rather than replacing anything already there. A hard link refuses to
/// overwrite even against other processes; `rename` would not.
fn claim(staged: &Path, candidate: &Path) -> io::Result<()> {
    match fs::hard_link(staged, candidate) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(staged) {
                warn!(file = %staged.display(), error = %e, "Failed to remove staging link");
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            // No hard links here (FAT, some network mounts)
            debug!(error = %e, "Hard link refused, falling back to rename");
            if !vacant(candidate) {
                return Err(io::Error::from(ErrorKind::AlreadyExists));
            }
            fs::rename(staged, candidate)
        }
    }
}

fn vacant(path: &Path) -> bool {
    matches!(fs::symlink_metadata(path), Err(e) if e.kind() == ErrorKind::NotFound)
}

fn is_file_of_size(path: &Path, size: u64) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() == size)
}

fn same_content(candidate: &Path, staged: &VerifiedFile) -> bool {
    match hash_file_sync(candidate) {
        Ok(hash) => hash.to_hex().as_str() == staged.hash,
        Err(e) => {
            debug!(path = %candidate.display(), error = %e, "Failed to hash existing file");
            false
        }
    }
}

/// Carry the remote modification time over to the archived copy.
fn set_mtime(path: &Path, mtime: DateTime<Utc>) {
    let time = FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos());
    if let Err(e) = filetime::set_file_mtime(path, time) {
        warn!(path = %path.display(), error = %e, "Failed to set modification time");
    }
}

/// Buffered writer over one staging file.
pub struct StagingWriter {
    file: BufWriter<tokio::fs::File>,
    written: u64,
}

impl StagingWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ArchiveError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| ArchiveError::from_io("write staging file", &e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and fsync so verification reads what is on disk.
    pub async fn finish(mut self) -> Result<u64, ArchiveError> {
        self.file
            .flush()
            .await
            .map_err(|e| ArchiveError::from_io("flush staging file", &e))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| ArchiveError::from_io("sync staging file", &e))?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    async fn stage(area: &StagingArea, content: &[u8]) -> VerifiedFile {
        let path = area.new_path();
        let mut writer = area.open(&path).await.unwrap();
        writer.write_chunk(content).await.unwrap();
        let size = writer.finish().await.unwrap();
        VerifiedFile {
            path,
            size,
            hash: blake3::hash(content).to_hex().to_string(),
        }
    }

    #[tokio::test]
    async fn test_staging_paths_are_unique_and_hidden() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());

        let a = area.new_path();
        let b = area.new_path();
        assert_ne!(a, b);
        assert!(a.starts_with(temp.path().join(".staging")));
        assert_eq!(a.extension().unwrap(), "part");
    }

    #[tokio::test]
    async fn test_reopen_truncates() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        let path = area.new_path();

        let mut writer = area.open(&path).await.unwrap();
        writer.write_chunk(b"first attempt, longer").await.unwrap();
        writer.finish().await.unwrap();

        let mut writer = area.open(&path).await.unwrap();
        writer.write_chunk(b"second").await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_place_creates_parents_and_sets_mtime() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        let staged = stage(&area, b"photo bytes").await;
        let destination = temp.path().join("Photos/2025/2025-06/trip.jpg");
        let mtime = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();

        let placed = area.place(&staged, &destination, Some(mtime)).await.unwrap();

        assert_eq!(placed.path, destination);
        assert!(!placed.reused);
        assert!(!staged.path.exists());
        let meta = std::fs::metadata(&destination).unwrap();
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            mtime.timestamp()
        );
    }

    #[tokio::test]
    async fn test_place_never_overwrites_different_content() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        let destination = temp.path().join("Other/notes.txt");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&destination, b"someone else's notes").unwrap();

        let staged = stage(&area, b"my notes").await;
        let placed = area.place(&staged, &destination, None).await.unwrap();

        assert_eq!(placed.path, temp.path().join("Other/notes(1).txt"));
        assert_eq!(std::fs::read(&destination).unwrap(), b"someone else's notes");
        assert_eq!(std::fs::read(&placed.path).unwrap(), b"my notes");
    }

    #[tokio::test]
    async fn test_place_reuses_identical_content() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        let destination = temp.path().join("Other/notes.txt");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&destination, b"same").unwrap();

        let staged = stage(&area, b"same").await;
        let placed = area.place(&staged, &destination, None).await.unwrap();

        assert_eq!(placed.path, destination);
        assert!(placed.reused);
        assert!(!staged.path.exists());
        assert!(!temp.path().join("Other/notes(1).txt").exists());
    }

    #[tokio::test]
    async fn test_claim_never_replaces_existing_file() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        let staged = stage(&area, b"mine").await;
        let taken = temp.path().join("taken.txt");
        std::fs::write(&taken, b"appeared meanwhile").unwrap();

        let err = claim(&staged.path, &taken).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&taken).unwrap(), b"appeared meanwhile");
        assert!(staged.path.exists());
    }

    #[tokio::test]
    async fn test_preview_matches_place() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        let destination = temp.path().join("Other/notes.txt");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&destination, b"other").unwrap();

        // Same size as the existing file: place would hash it and reuse
        let same = area.preview(&destination, Some(5));
        assert_eq!(same, destination);
        let staged = stage(&area, b"other").await;
        assert_eq!(area.place(&staged, &destination, None).await.unwrap().path, same);

        // Different size: the next free name
        let different = area.preview(&destination, Some(8));
        assert_eq!(different, temp.path().join("Other/notes(1).txt"));
        let staged = stage(&area, b"my notes").await;
        assert_eq!(area.place(&staged, &destination, None).await.unwrap().path, different);

        // Preview writes nothing
        assert!(!temp.path().join("Other/notes(2).txt").exists());
        assert_eq!(area.preview(&destination, None), temp.path().join("Other/notes(2).txt"));
    }

    #[tokio::test]
    async fn test_free_space_reports_something() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(&temp.path().join("archive"));
        assert!(area.free_space().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_discard_missing_is_quiet() {
        let temp = tempdir().unwrap();
        let area = StagingArea::new(temp.path());
        area.discard(&temp.path().join(".staging/nothing.part")).await;
    }
}
