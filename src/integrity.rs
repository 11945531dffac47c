//! Integrity validation of finished downloads
//!
//! - [`validate_checksum`] hashes the file and compares it to the expected digest
//! - [`validate_archive`] opens the file as a ZIP container and enumerates its
//!   entries (jar and modpack formats are ZIP containers too)
//!
//! Both run on the blocking thread pool since they read the whole file.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{Checksum, HashAlgorithm};

/// Extensions of ZIP-based payloads that get archive validation by default
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "jar", "mrpack", "litemod"];

/// Whether the destination name indicates an archive payload
pub fn is_archive_path(path: &Path) -> bool {
    crate::utils::extension_lowercase(path)
        .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

/// Whether archive validation applies, honoring an explicit caller override
pub fn archive_validation_applies(destination: &Path, override_flag: Option<bool>) -> bool {
    override_flag.unwrap_or_else(|| is_archive_path(destination))
}

/// Hash `path` and fail with [`Error::ChecksumMismatch`] if it differs from `expected`
pub async fn validate_checksum(path: &Path, expected: &Checksum) -> Result<()> {
    let owned = path.to_path_buf();
    let algorithm = expected.algorithm;
    let actual = tokio::task::spawn_blocking(move || hash_file(&owned, algorithm))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    if actual.eq_ignore_ascii_case(&expected.hex) {
        tracing::debug!(?path, algorithm = ?expected.algorithm, "checksum verified");
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.hex.clone(),
            actual,
        })
    }
}

/// Lowercase hex digest of a file
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    use sha2::Digest;

    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];

    macro_rules! digest_with {
        ($hasher:expr) => {{
            let mut hasher = $hasher;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            format!("{:x}", hasher.finalize())
        }};
    }

    let hex = match algorithm {
        HashAlgorithm::Sha1 => digest_with!(sha1::Sha1::new()),
        HashAlgorithm::Sha256 => digest_with!(sha2::Sha256::new()),
        HashAlgorithm::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                context.consume(&buf[..n]);
            }
            format!("{:x}", context.compute())
        }
    };
    Ok(hex)
}

/// Open `path` as a ZIP container and walk every entry header
///
/// Entry contents are not decompressed; any parse failure is reported as
/// [`Error::ArchiveCorrupt`].
pub async fn validate_archive(path: &Path) -> Result<()> {
    let owned = path.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || enumerate_entries(&owned))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    tracing::debug!(?path, entries, "archive structure verified");
    Ok(())
}

fn enumerate_entries(path: &PathBuf) -> Result<usize> {
    let corrupt = |reason: String| Error::ArchiveCorrupt {
        path: path.clone(),
        reason,
    };

    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    for index in 0..archive.len() {
        archive
            .by_index_raw(index)
            .map_err(|e| corrupt(format!("entry {index}: {e}")))?;
    }
    Ok(archive.len())
}
