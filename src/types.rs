//! Core types for mirror-dl

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Identifier of one `fetch` call, used to correlate events
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Allocate the next process-unique request ID
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of one candidate attempt
///
/// `Pending → CacheCheck → (SkippedUnchanged | Probing) → Transferring → Validating → (Succeeded | Failed)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Attempt created, nothing sent yet
    Pending,
    /// Conditional request against the cached validators
    CacheCheck,
    /// Server reported the destination unchanged; request finished
    SkippedUnchanged,
    /// Ranged probe for challenge pages
    Probing,
    /// Body is streaming into the pending file
    Transferring,
    /// Challenge, archive, size and checksum checks
    Validating,
    /// Destination is in place; request finished
    Succeeded,
    /// This candidate failed
    Failed,
}

impl Stage {
    /// Whether this stage ends the whole request successfully
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Stage::SkippedUnchanged | Stage::Succeeded)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::CacheCheck => "cache_check",
            Stage::SkippedUnchanged => "skipped_unchanged",
            Stage::Probing => "probing",
            Stage::Transferring => "transferring",
            Stage::Validating => "validating",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Event emitted while a request runs
///
/// Events of one request are emitted in order by the task driving it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A candidate attempt moved to a new stage
    StageChanged {
        /// Request ID
        id: RequestId,
        /// Candidate URL
        url: String,
        /// New stage
        stage: Stage,
    },

    /// Bytes written to the pending file so far
    Progress {
        /// Request ID
        id: RequestId,
        /// Candidate URL
        url: String,
        /// Bytes received for this attempt
        bytes: u64,
        /// Total size if the server reported one
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },

    /// A candidate failed; the engine moves on or gives up
    CandidateFailed {
        /// Request ID
        id: RequestId,
        /// Candidate URL
        url: String,
        /// Error message
        error: String,
    },
}

/// Where a candidate URL came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// The authoritative URL as supplied
    Direct,
    /// Produced by a mirror rewrite rule
    Mirror,
}

/// One URL with its provenance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorCandidate {
    /// Candidate URL
    pub url: String,
    /// Provenance
    pub source: CandidateSource,
}

impl MirrorCandidate {
    /// Candidate for the authoritative URL
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: CandidateSource::Direct,
        }
    }

    /// Candidate produced by a rewrite
    pub fn mirror(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: CandidateSource::Mirror,
        }
    }
}

/// Digest algorithm of a [`Checksum`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-1 (40 hex chars)
    Sha1,
    /// SHA-256 (64 hex chars)
    Sha256,
    /// MD5 (32 hex chars)
    Md5,
}

impl HashAlgorithm {
    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(HashAlgorithm::Sha1),
            64 => Some(HashAlgorithm::Sha256),
            32 => Some(HashAlgorithm::Md5),
            _ => None,
        }
    }
}

/// Expected digest of a download
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Digest algorithm
    pub algorithm: HashAlgorithm,
    /// Expected digest, lowercase hex
    pub hex: String,
}

impl Checksum {
    /// SHA-1 checksum
    pub fn sha1(hex: impl AsRef<str>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha1,
            hex: hex.as_ref().to_ascii_lowercase(),
        }
    }

    /// SHA-256 checksum
    pub fn sha256(hex: impl AsRef<str>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            hex: hex.as_ref().to_ascii_lowercase(),
        }
    }
}

impl std::str::FromStr for Checksum {
    type Err = crate::Error;

    /// Parse `"sha1:<hex>"`, `"sha256:<hex>"`, `"md5:<hex>"`, or bare hex
    /// (algorithm inferred from its length).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::Config {
            message: format!("invalid checksum descriptor: {s}"),
            key: Some("checksum".to_string()),
        };

        let (algorithm, hex) = match s.split_once(':') {
            Some((algo, hex)) => {
                let algorithm = match algo.to_ascii_lowercase().as_str() {
                    "sha1" => HashAlgorithm::Sha1,
                    "sha256" => HashAlgorithm::Sha256,
                    "md5" => HashAlgorithm::Md5,
                    _ => return Err(invalid()),
                };
                (algorithm, hex.trim())
            }
            None => {
                let hex = s.trim();
                (HashAlgorithm::from_hex_len(hex.len()).ok_or_else(invalid)?, hex)
            }
        };

        if HashAlgorithm::from_hex_len(hex.len()) != Some(algorithm)
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(invalid());
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

/// Per-request options for [`crate::DownloadEngine::fetch`]
///
/// Immutable for the lifetime of one fetch call.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Expected digest; absence skips checksum validation
    pub checksum: Option<Checksum>,

    /// Expected total size in bytes
    pub expected_size: Option<u64>,

    /// Extra request headers (name, value)
    pub headers: Vec<(String, String)>,

    /// Override of the configured connection limit for segmented transfers
    pub max_connections: Option<usize>,

    /// Force archive validation on (`Some(true)`) or off (`Some(false)`);
    /// `None` decides from the destination extension
    pub validate_archive: Option<bool>,

    /// Reuse an existing connection pool instead of the engine's client
    pub client: Option<reqwest::Client>,

    /// Key for the conditional cache; `None` keys by each candidate URL.
    /// [`crate::DownloadEngine::fetch_via_provider`] sets it to the canonical URL.
    pub cache_key: Option<String>,

    /// Outer cancellation (e.g. application shutdown)
    pub cancel: Option<CancellationToken>,
}

impl FetchOptions {
    /// Options with an expected checksum
    pub fn with_checksum(checksum: Checksum) -> Self {
        Self {
            checksum: Some(checksum),
            ..Default::default()
        }
    }
}

/// How a successful fetch ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Request ID used in emitted events
    pub id: RequestId,
    /// Candidate that satisfied the request
    pub url: String,
    /// Terminal stage: [`Stage::Succeeded`] or [`Stage::SkippedUnchanged`]
    pub stage: Stage,
    /// Bytes transferred (0 when skipped)
    pub bytes: u64,
}
