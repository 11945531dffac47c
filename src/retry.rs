//! Retry logic with exponential backoff
//!
//! Only the sending of idempotent requests is retried (the range-planning HEAD,
//! the initial GET of a transfer and each segment's range GET). A transfer that stalls or fails
//! validation is never retried against the same candidate; the engine moves on
//! to the next one instead.
//!
//! # Example
//!
//! ```no_run
//! use mirror_dl::retry::{IsRetryable, download_with_retry};
//! use mirror_dl::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum ProbeError {
//!     Busy,
//!     Gone,
//! }
//!
//! impl std::fmt::Display for ProbeError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for ProbeError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, ProbeError::Busy)
//!     }
//! }
//!
//! # async fn example() -> Result<(), ProbeError> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! download_with_retry(&config, &cancel, || async { Ok::<_, ProbeError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (connect errors, timeouts, overloaded servers) return `true`.
/// Anything that would fail the same way again returns `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { source, .. } => source.is_connect() || source.is_timeout(),
            // 408 Request Timeout, 429 Too Many Requests and server errors
            Error::HttpStatus { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Error::Timeout { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            // Payload-level failures repeat on every try against the same URL
            Error::Stalled { .. }
            | Error::ChallengeDetected { .. }
            | Error::ChecksumMismatch { .. }
            | Error::SizeMismatch { .. }
            | Error::ArchiveCorrupt { .. } => false,
            Error::AllCandidatesFailed(_)
            | Error::Cancelled
            | Error::NoCandidates
            | Error::Config { .. }
            | Error::Serialization(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation runs once plus up to `config.max_attempts` retries. Backoff
/// sleeps end early when `cancel` fires, returning the last error so the caller
/// can observe the cancellation itself.
pub async fn download_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "request succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "request failed, retrying"
                );

                let wait = if config.jitter { add_jitter(delay) } else { delay };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(e),
                }

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::debug!(error = %e, attempts = attempt + 1, "retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Spread a delay uniformly over `[delay, 2 * delay]`
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn status(code: u16) -> Error {
        Error::HttpStatus {
            url: "https://example.com/a".to_string(),
            status: code,
        }
    }

    async fn count_calls(config: &RetryConfig, fail_times: u32, err: fn() -> Error) -> (u32, bool) {
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result = download_with_retry(config, &cancel, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < fail_times {
                    Err(err())
                } else {
                    Ok(())
                }
            }
        })
        .await;
        (counter.load(Ordering::SeqCst), result.is_ok())
    }

    #[tokio::test]
    async fn transient_status_is_retried_until_success() {
        let (calls, ok) = count_calls(&quick(3), 2, || status(503)).await;
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (calls, ok) = count_calls(&quick(2), 10, || status(429)).await;
        assert!(!ok);
        assert_eq!(calls, 3, "initial attempt plus two retries");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (calls, ok) = count_calls(&quick(3), 10, || status(404)).await;
        assert!(!ok);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn zero_max_attempts_runs_once() {
        let (calls, ok) = count_calls(&quick(0), 10, || status(500)).await;
        assert!(!ok);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result =
            download_with_retry(&config, &cancel, || async { Err::<(), _>(status(502)) }).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn delays_grow_and_are_capped() {
        // Mirrors the loop's arithmetic: 10 -> 20 -> 40 -> 40
        let config = quick(4);
        let mut delay = config.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(delay);
            delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
                .min(config.max_delay);
        }
        assert_eq!(
            seen,
            [10, 20, 40, 40].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn add_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(50);
        for _ in 0..200 {
            let jittered = add_jitter(delay);
            assert!(jittered >= delay && jittered <= delay * 2);
        }
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn classification() {
        assert!(status(500).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(
            Error::Timeout {
                url: "u".into(),
                phase: "headers"
            }
            .is_retryable()
        );
        assert!(
            !Error::ChallengeDetected {
                url: "u".into(),
                status: Some(200),
                content_type: None
            }
            .is_retryable()
        );
        assert!(!Error::Cancelled.is_retryable());
        assert!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
                .is_retryable()
        );
        assert!(
            !Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
                .is_retryable()
        );
    }
}
