//! Utility functions for path derivation and best-effort cleanup

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix of the sibling file a transfer writes to before it is validated
pub const PENDING_SUFFIX: &str = "pending";

/// `path` with `.{suffix}` appended to its file name
///
/// # Examples
///
/// ```
/// use mirror_dl::utils::sibling_with_suffix;
/// use std::path::{Path, PathBuf};
///
/// assert_eq!(
///     sibling_with_suffix(Path::new("/tmp/client.jar"), "pending"),
///     PathBuf::from("/tmp/client.jar.pending")
/// );
/// ```
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("download"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Pending sibling of a destination (`<dest>.pending`)
pub fn pending_path(destination: &Path) -> PathBuf {
    sibling_with_suffix(destination, PENDING_SUFFIX)
}

/// Part file for segment `index` of a segmented transfer (`<dest>.pending.<index>`)
pub fn part_path(destination: &Path, index: usize) -> PathBuf {
    sibling_with_suffix(&pending_path(destination), &index.to_string())
}

/// Remove a file, ignoring "not found" and logging anything else
///
/// Cleanup must never mask the failure that triggered it, so errors are not returned.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::trace!(?path, "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(?path, error = %e, "failed to remove file during cleanup"),
    }
}

/// Combined size of every existing file in `paths`
pub async fn total_size(paths: &[PathBuf]) -> u64 {
    let mut total = 0;
    for path in paths {
        if let Ok(metadata) = tokio::fs::metadata(path).await {
            total += metadata.len();
        }
    }
    total
}

/// Lowercase extension of a path, if any
pub fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}
