//! # mirror-dl
//!
//! Resilient single-file downloads across interchangeable mirror candidates.
//!
//! ## Design Philosophy
//!
//! mirror-dl is designed to be:
//! - **Distrustful** - no single source is trusted; stalls, challenge pages,
//!   corrupt archives and bad digests all move on to the next candidate
//! - **Sequential** - candidates are tried one at a time, best-ranked first
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use mirror_dl::{Checksum, Config, DownloadEngine, FetchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DownloadEngine::new(Config::default())?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let options = FetchOptions::with_checksum(Checksum::sha1(
//!         "f2a8a8a8c8e4e2c5b3f6b8a1f6a7c5f0e8d1c2b3",
//!     ));
//!     engine
//!         .fetch_via_provider(
//!             "https://libraries.minecraft.net/com/mojang/brigadier/1.0.18/brigadier-1.0.18.jar",
//!             "libraries/brigadier-1.0.18.jar",
//!             options,
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Conditional-request validator store
pub mod cache;
/// Challenge page detection
pub mod challenge;
/// Configuration types
pub mod config;
/// Download engine (candidate fallback, transfer, validation)
pub mod engine;
/// Error types
pub mod error;
/// HTTP client construction and helpers
pub mod http;
/// Checksum and archive validation
pub mod integrity;
/// Mirror rewriting and ranking
pub mod mirror;
/// Retry logic with exponential backoff
pub mod retry;
/// Stall watchdog
pub mod stall;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use cache::{CacheEntry, ConditionalCache};
pub use challenge::{ChallengeDetector, ProbeResult};
pub use config::Config;
pub use engine::DownloadEngine;
pub use error::{CandidateFailure, Error, Result};
pub use mirror::{
    AutoProvider, DirectProvider, MirrorMode, MirrorPreferringProvider, MirrorProvider,
    MirrorScore, MirrorScoreboard,
};
pub use stall::{StallHandle, StallMonitor};
pub use types::{
    CandidateSource, Checksum, Event, FetchOptions, FetchOutcome, HashAlgorithm, MirrorCandidate,
    RequestId, Stage,
};

/// Cancel `token` when the process receives a termination signal.
///
/// Pass the token (or a child of it) as [`FetchOptions::cancel`] so that
/// in-flight downloads clean up their pending files on shutdown.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use mirror_dl::{Config, DownloadEngine, FetchOptions, cancel_on_shutdown};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = DownloadEngine::new(Config::default())?;
///     let shutdown = CancellationToken::new();
///     tokio::spawn(cancel_on_shutdown(shutdown.clone()));
///
///     let options = FetchOptions {
///         cancel: Some(shutdown),
///         ..Default::default()
///     };
///     engine
///         .fetch(["https://example.com/pack.zip"], "pack.zip", options)
///         .await?;
///     Ok(())
/// }
/// ```
pub async fn cancel_on_shutdown(token: tokio_util::sync::CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => token.cancel(),
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("received SIGINT");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("received SIGTERM");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
