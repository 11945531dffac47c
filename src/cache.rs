//! Persisted conditional-request validators
//!
//! Maps a URL to the `ETag`/`Last-Modified` validators seen on the last
//! successful download or conditional check. The store is a single JSON file,
//! loaded lazily on first use and kept in memory afterwards.
//!
//! The cache is an optimization only: read and write failures are logged and
//! otherwise ignored, and a missing or unreadable store behaves as empty.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Validators for one URL
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// `ETag` response header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// `Last-Modified` response header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Unix timestamp in milliseconds of the last refresh
    pub updated_at: i64,
}

impl CacheEntry {
    /// Entry stamped with the current time
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether the entry carries at least one validator
    pub fn has_validator(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Read the validators off a response, if it has any
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let read = |name: reqwest::header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let entry = Self::new(
            read(reqwest::header::ETAG),
            read(reqwest::header::LAST_MODIFIED),
        );
        entry.has_validator().then_some(entry)
    }
}

type Store = HashMap<String, CacheEntry>;

/// JSON-backed validator store
///
/// Cloning is cheap and clones share the in-memory copy.
#[derive(Clone, Debug)]
pub struct ConditionalCache {
    path: PathBuf,
    entries: Arc<OnceCell<Mutex<Store>>>,
}

impl ConditionalCache {
    /// Cache backed by the JSON file at `path` (not read until first use)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Arc::new(OnceCell::new()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached validators for `url`
    pub async fn get(&self, url: &str) -> Option<CacheEntry> {
        self.entries().await.lock().await.get(url).cloned()
    }

    /// Store validators for `url` and persist the store
    pub async fn set(&self, url: &str, entry: CacheEntry) {
        let mut entries = self.entries().await.lock().await;
        entries.insert(url.to_string(), entry.clone());

        // Merge into whatever is on disk now; concurrent writers resolve last-writer-wins
        let mut on_disk = read_store(&self.path).await;
        on_disk.insert(url.to_string(), entry);
        self.persist(&on_disk).await;
    }

    /// Forget the validators for `url`
    pub async fn remove(&self, url: &str) {
        let mut entries = self.entries().await.lock().await;
        entries.remove(url);

        let mut on_disk = read_store(&self.path).await;
        if on_disk.remove(url).is_some() {
            self.persist(&on_disk).await;
        }
    }

    /// Drop every entry, in memory and on disk
    pub async fn clear(&self) {
        self.entries().await.lock().await.clear();
        if let Err(e) = tokio::fs::remove_file(&self.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = ?self.path, error = %e, "failed to remove conditional cache");
        }
    }

    async fn entries(&self) -> &Mutex<Store> {
        self.entries
            .get_or_init(|| async { Mutex::new(read_store(&self.path).await) })
            .await
    }

    async fn persist(&self, store: &Store) {
        if let Err(e) = write_store(&self.path, store).await {
            tracing::warn!(path = ?self.path, error = %e, "failed to persist conditional cache");
        }
    }
}

async fn read_store(path: &Path) -> Store {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?path, error = %e, "failed to read conditional cache");
            }
            return Store::new();
        }
    };

    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        tracing::warn!(?path, error = %e, "conditional cache is malformed, starting empty");
        Store::new()
    })
}

async fn write_store(path: &Path, store: &Store) -> crate::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(store)?;

    // Write-then-rename so readers never see a half-written store
    let tmp = crate::utils::sibling_with_suffix(path, "tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
