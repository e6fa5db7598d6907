//! Checks a staged download before it may enter the archive.

use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ArchiveError;

/// Facts about a staged file that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFile {
    pub path: PathBuf,
    pub size: u64,
    /// BLAKE3, hex encoded
    pub hash: String,
}

/// Check a staged download before it is allowed anywhere near the archive:
/// it must exist, be non-empty, match the remote size when one is known,
/// and hash cleanly.
pub async fn verify_staged(
    path: &Path,
    expected_size: Option<u64>,
) -> Result<VerifiedFile, ArchiveError> {
    let path = path.to_path_buf();

    // Hashing is I/O heavy
    tokio::task::spawn_blocking(move || verify_staged_sync(&path, expected_size))
        .await
        .map_err(|e| ArchiveError::Integrity(format!("verification task failed: {}", e)))?
}

fn verify_staged_sync(path: &Path, expected_size: Option<u64>) -> Result<VerifiedFile, ArchiveError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ArchiveError::Integrity(format!("staged file {} unreadable: {}", path.display(), e))
    })?;
    let size = metadata.len();

    if size == 0 {
        return Err(ArchiveError::Integrity(format!(
            "staged file {} is empty",
            path.display()
        )));
    }

    match expected_size {
        Some(expected) if expected != size => {
            return Err(ArchiveError::Integrity(format!(
                "size mismatch: staged {} bytes, remote reports {}",
                size, expected
            )));
        }
        _ => {}
    }

    let hash = hash_file_sync(path)
        .map_err(|e| ArchiveError::Integrity(format!("failed to hash {}: {}", path.display(), e)))?;

    debug!(file = %path.display(), size, "Staged file verified");

    Ok(VerifiedFile {
        path: path.to_path_buf(),
        size,
        hash: hash.to_hex().to_string(),
    })
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files.
pub fn hash_file_sync(path: &Path) -> std::io::Result<blake3::Hash> {
    let file = std::fs::File::open(path)?;

    let mut reader = std::io::BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 128 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}
