//! Configuration types for mirror-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::mirror::{MirrorMode, RewriteRule};

/// Transfer behavior (stall detection, challenge probing, segmentation)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Abort a transfer when the pending file does not grow for this long (default: 20s)
    #[serde(default = "default_stall_window", with = "duration_millis")]
    pub stall_window: Duration,

    /// How often the stall monitor checks the pending file (default: 2s)
    #[serde(default = "default_stall_tick", with = "duration_millis")]
    pub stall_tick: Duration,

    /// Whether to probe candidates for challenge pages before transferring (default: true)
    ///
    /// Probing is skipped whenever a checksum or archive validation already
    /// applies to the request.
    #[serde(default = "default_true")]
    pub challenge_probe: bool,

    /// Bytes requested by the probe and inspected after download (default: 16 KiB)
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: usize,

    /// Timeout for the whole probe request (default: 5s)
    #[serde(default = "default_probe_timeout", with = "duration_millis")]
    pub probe_timeout: Duration,

    /// Files at least this large are fetched with concurrent range requests (default: 16 MiB)
    #[serde(default = "default_segmented_threshold")]
    pub segmented_threshold: u64,

    /// Upper bound on concurrent range requests against one URL (default: 4)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Minimum spacing between progress events of one request (default: 250ms)
    #[serde(default = "default_progress_interval", with = "duration_millis")]
    pub progress_interval: Duration,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            stall_window: default_stall_window(),
            stall_tick: default_stall_tick(),
            challenge_probe: true,
            probe_bytes: default_probe_bytes(),
            probe_timeout: default_probe_timeout(),
            segmented_threshold: default_segmented_threshold(),
            max_connections: default_max_connections(),
            progress_interval: default_progress_interval(),
            user_agent: default_user_agent(),
        }
    }
}

/// Layered network timeouts
///
/// All of them are longer than the stall window, so the stall monitor fires
/// first on a connected-but-silent transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection establishment (default: 30s)
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect: Duration,

    /// Waiting for response headers after the request was sent (default: 45s)
    #[serde(default = "default_header_timeout", with = "duration_millis")]
    pub headers: Duration,

    /// Whole response body (default: 30 minutes)
    #[serde(default = "default_body_timeout", with = "duration_millis")]
    pub body: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            headers: default_header_timeout(),
            body: default_body_timeout(),
        }
    }
}

/// Retry configuration with exponential backoff
///
/// Only applies to sending idempotent requests. A stalled or invalid transfer
/// is never retried against the same URL; the engine moves to the next candidate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 2)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500ms)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Mirror rewriting tables
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Which provider the engine uses for canonical URLs (default: auto)
    #[serde(default)]
    pub mode: MirrorMode,

    /// Ordered prefix rewrite rules; the first match wins
    #[serde(default = "default_rules")]
    pub rules: Vec<RewriteRule>,

    /// Well-known Maven artifact roots ("Maven-shaped" URLs live under these)
    #[serde(default = "default_maven_roots")]
    pub maven_roots: Vec<String>,

    /// Mirror roots that each get one candidate for a Maven-shaped URL
    #[serde(default = "default_maven_mirrors")]
    pub maven_mirrors: Vec<String>,

    /// Authoritative version manifest
    #[serde(default = "default_version_manifest")]
    pub version_manifest: String,

    /// Mirrored version manifest
    #[serde(default = "default_version_manifest_mirror")]
    pub version_manifest_mirror: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            mode: MirrorMode::default(),
            rules: default_rules(),
            maven_roots: default_maven_roots(),
            maven_mirrors: default_maven_mirrors(),
            version_manifest: default_version_manifest(),
            version_manifest_mirror: default_version_manifest_mirror(),
        }
    }
}

/// Conditional-request cache location
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// JSON store of validators (default: `<data dir>/mirror-dl/conditional-cache.json`)
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

/// Main configuration for [`crate::DownloadEngine`]
///
/// Every field has a default, so `Config::default()` works out of the box and a
/// JSON document only needs the keys it wants to change.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transfer behavior
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Network timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Request retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Maximum redirects followed per request (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Mirror rewriting
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Conditional cache
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.transfer.stall_tick.is_zero() {
            return Err(crate::Error::Config {
                message: "stall tick must be greater than zero".to_string(),
                key: Some("transfer.stall_tick".to_string()),
            });
        }
        if self.transfer.stall_tick > self.transfer.stall_window {
            return Err(crate::Error::Config {
                message: "stall tick must not exceed the stall window".to_string(),
                key: Some("transfer.stall_tick".to_string()),
            });
        }
        if self.transfer.max_connections == 0 {
            return Err(crate::Error::Config {
                message: "at least one connection is required".to_string(),
                key: Some("transfer.max_connections".to_string()),
            });
        }
        for rule in &self.mirror.rules {
            if rule.prefix.is_empty() {
                return Err(crate::Error::Config {
                    message: "rewrite rule prefix must not be empty".to_string(),
                    key: Some("mirror.rules".to_string()),
                });
            }
        }
        Ok(())
    }
}

const BMCLAPI: &str = "https://bmclapi2.bangbang93.com";

fn default_stall_window() -> Duration {
    Duration::from_secs(20)
}

fn default_stall_tick() -> Duration {
    Duration::from_secs(2)
}

fn default_probe_bytes() -> usize {
    16 * 1024
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_segmented_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_max_connections() -> usize {
    4
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_user_agent() -> String {
    format!("mirror-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_header_timeout() -> Duration {
    Duration::from_secs(45)
}

fn default_body_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_redirects() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_rules() -> Vec<RewriteRule> {
    [
        ("https://piston-meta.mojang.com", BMCLAPI.to_string()),
        ("https://launchermeta.mojang.com", BMCLAPI.to_string()),
        ("https://piston-data.mojang.com", BMCLAPI.to_string()),
        ("https://launcher.mojang.com", BMCLAPI.to_string()),
        (
            "https://resources.download.minecraft.net",
            format!("{BMCLAPI}/assets"),
        ),
        ("https://libraries.minecraft.net", format!("{BMCLAPI}/maven")),
        (
            "https://maven.minecraftforge.net",
            format!("{BMCLAPI}/maven"),
        ),
        (
            "https://files.minecraftforge.net/maven",
            format!("{BMCLAPI}/maven"),
        ),
        (
            "https://maven.neoforged.net/releases",
            format!("{BMCLAPI}/maven"),
        ),
        ("https://maven.fabricmc.net", format!("{BMCLAPI}/maven")),
        ("https://meta.fabricmc.net", format!("{BMCLAPI}/fabric-meta")),
        (
            "https://maven.quiltmc.org/repository/release",
            format!("{BMCLAPI}/maven"),
        ),
    ]
    .into_iter()
    .map(|(prefix, replacement)| RewriteRule {
        prefix: prefix.to_string(),
        replacement,
    })
    .collect()
}

fn default_maven_roots() -> Vec<String> {
    [
        "https://libraries.minecraft.net",
        "https://maven.minecraftforge.net",
        "https://maven.neoforged.net/releases",
        "https://maven.fabricmc.net",
        "https://maven.quiltmc.org/repository/release",
        "https://repo1.maven.org/maven2",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_maven_mirrors() -> Vec<String> {
    vec![
        format!("{BMCLAPI}/maven"),
        "https://maven.aliyun.com/repository/public".to_string(),
    ]
}

fn default_version_manifest() -> String {
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json".to_string()
}

fn default_version_manifest_mirror() -> String {
    format!("{BMCLAPI}/mc/game/version_manifest_v2.json")
}

fn default_cache_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mirror-dl")
        .join("conditional-cache.json")
}

// Durations are stored as integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
