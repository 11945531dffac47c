//! Error types for mirror-dl
//!
//! Every failure a single candidate can hit has its own variant so that the
//! engine can decide whether to advance to the next candidate or stop. Only
//! [`Error::AllCandidatesFailed`], [`Error::Cancelled`] and request-level errors
//! escape [`crate::DownloadEngine::fetch`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for mirror-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mirror-dl
#[derive(Debug, Error)]
pub enum Error {
    /// No growth of the pending file was observed within the stall window
    #[error("transfer from {url} stalled: no progress for {}s", .window.as_secs_f64())]
    Stalled {
        /// Candidate URL whose transfer stalled
        url: String,
        /// Stall window that elapsed without progress
        window: Duration,
    },

    /// The server answered with an interstitial page instead of the payload
    #[error("challenge page detected at {url} (status {status:?}, content-type {content_type:?})")]
    ChallengeDetected {
        /// Candidate URL that served the challenge page
        url: String,
        /// HTTP status of the response, if known
        status: Option<u16>,
        /// Content-Type header of the response, if known
        content_type: Option<String>,
    },

    /// The downloaded file does not match the expected digest
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that was hashed
        path: PathBuf,
        /// Expected digest (lowercase hex)
        expected: String,
        /// Actual digest (lowercase hex)
        actual: String,
    },

    /// The downloaded file is not the size the caller expected
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        /// File that was measured
        path: PathBuf,
        /// Expected size in bytes
        expected: u64,
        /// Actual size in bytes
        actual: u64,
    },

    /// The downloaded archive cannot be enumerated
    #[error("archive {path} is corrupt: {reason}")]
    ArchiveCorrupt {
        /// Archive that failed to parse
        path: PathBuf,
        /// Parser error message
        reason: String,
    },

    /// Connection, DNS, TLS or body-stream failure
    #[error("transport error for {url}: {source}")]
    Transport {
        /// Candidate URL
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    HttpStatus {
        /// Candidate URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// A layered timeout (headers or body) elapsed
    #[error("timed out waiting for {phase} from {url}")]
    Timeout {
        /// Candidate URL
        url: String,
        /// Which phase timed out ("headers" or "body")
        phase: &'static str,
    },

    /// Every candidate failed; errors are kept in attempt order
    #[error("all {} candidates failed: {}", .0.len(), summarize(.0))]
    AllCandidatesFailed(Vec<CandidateFailure>),

    /// The request was cancelled from outside (e.g. application shutdown)
    #[error("download cancelled")]
    Cancelled,

    /// The request carried no candidate URLs
    #[error("no candidate URLs supplied")]
    NoCandidates,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "mirror.rules")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One failed candidate inside [`Error::AllCandidatesFailed`]
#[derive(Debug)]
pub struct CandidateFailure {
    /// Candidate URL that was attempted
    pub url: String,
    /// Why the attempt failed
    pub error: Error,
}

impl std::fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.url, self.error)
    }
}

fn summarize(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Build a transport error for `url`
    pub(crate) fn transport(url: &str, source: reqwest::Error) -> Self {
        Error::Transport {
            url: url.to_string(),
            source,
        }
    }

    /// Whether the engine may move on to the next candidate after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Stalled { .. }
            | Error::ChallengeDetected { .. }
            | Error::ChecksumMismatch { .. }
            | Error::SizeMismatch { .. }
            | Error::ArchiveCorrupt { .. }
            | Error::Transport { .. }
            | Error::HttpStatus { .. }
            | Error::Timeout { .. }
            | Error::Io(_) => true,
            Error::AllCandidatesFailed(_)
            | Error::Cancelled
            | Error::NoCandidates
            | Error::Config { .. }
            | Error::Serialization(_) => false,
        }
    }

    /// Whether this is one of the transport-level failures
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::HttpStatus { .. } | Error::Timeout { .. }
        )
    }

    /// Per-candidate failures of an aggregate error (empty for any other kind)
    pub fn failures(&self) -> &[CandidateFailure] {
        match self {
            Error::AllCandidatesFailed(failures) => failures,
            _ => &[],
        }
    }
}
