//! Download engine split into focused submodules.
//!
//! - [`attempt`] - per-candidate state machine (cache check, probe, transfer, validation)
//! - [`transfer`] - single-stream and segmented body transfer into the pending file
//! - [`progress`] - throttled progress events
//!
//! [`DownloadEngine::fetch`] tries candidates strictly one after another. A
//! candidate that fails for any recoverable reason is cleaned up, reported to
//! the scoreboard, and the next one is tried.

mod attempt;
mod progress;
mod transfer;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cache::ConditionalCache;
use crate::challenge::ChallengeDetector;
use crate::config::Config;
use crate::error::{CandidateFailure, Error, Result};
use crate::mirror::{MirrorProvider, MirrorScoreboard, provider_for};
use crate::types::{Event, FetchOptions, FetchOutcome, RequestId};

use attempt::Attempt;

/// Capacity of the event channel; slow subscribers lag instead of blocking transfers
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Entry point for managed downloads
///
/// Holds the pooled HTTP client plus the state shared across requests (scoreboard
/// and conditional cache). Both are injectable through [`DownloadEngine::with_state`],
/// so independent engines can coexist in one process.
#[derive(Clone)]
pub struct DownloadEngine {
    config: Arc<Config>,
    client: reqwest::Client,
    scoreboard: MirrorScoreboard,
    cache: ConditionalCache,
    provider: Arc<dyn MirrorProvider>,
    challenge: ChallengeDetector,
    event_tx: broadcast::Sender<Event>,
    /// Cancellation tokens of requests currently in flight
    active: Arc<DashMap<RequestId, CancellationToken>>,
    accepting_new: Arc<AtomicBool>,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("cache", &self.cache.path())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    /// Create an engine with a fresh scoreboard and the cache file from `config.cache.path`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is inconsistent or the HTTP
    /// client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let cache = ConditionalCache::new(config.cache.path.clone());
        Self::with_state(config, MirrorScoreboard::new(), cache)
    }

    /// Create an engine around existing shared state
    pub fn with_state(
        config: Config,
        scoreboard: MirrorScoreboard,
        cache: ConditionalCache,
    ) -> Result<Self> {
        config.validate()?;
        let client = crate::http::build_client(&config)?;
        let provider = provider_for(&config.mirror, scoreboard.clone());
        let challenge = ChallengeDetector::from_config(&config.transfer);
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::debug!(
            mode = ?config.mirror.mode,
            cache = ?cache.path(),
            "download engine created"
        );

        Ok(Self {
            config: Arc::new(config),
            client,
            scoreboard,
            cache,
            provider,
            challenge,
            event_tx,
            active: Arc::new(DashMap::new()),
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Subscribe to stage, progress and failure events of every request
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mirror provider selected by the configured mode
    pub fn provider(&self) -> Arc<dyn MirrorProvider> {
        Arc::clone(&self.provider)
    }

    /// Shared scoreboard
    pub fn scoreboard(&self) -> &MirrorScoreboard {
        &self.scoreboard
    }

    /// Shared conditional cache
    pub fn cache(&self) -> &ConditionalCache {
        &self.cache
    }

    /// Feed a caller's own measurement into the scoreboard
    pub fn record_success(&self, url: &str, latency_ms: u64) {
        self.scoreboard.record_success(url, latency_ms);
    }

    /// Feed a caller's own failure into the scoreboard
    pub fn record_failure(&self, url: &str) {
        self.scoreboard.record_failure(url);
    }

    /// Download one resource, trying `candidates` in order until one succeeds
    ///
    /// The destination is only ever replaced by a fully validated file. If it
    /// already exists and the server confirms it unchanged, nothing is
    /// transferred.
    ///
    /// # Errors
    ///
    /// - the single candidate's error when exactly one candidate was tried
    /// - [`Error::AllCandidatesFailed`] with every error in attempt order otherwise
    /// - [`Error::Cancelled`] if the outer token or [`DownloadEngine::shutdown`] fired
    /// - [`Error::NoCandidates`] for an empty candidate list
    pub async fn fetch<I, S>(
        &self,
        candidates: I,
        destination: impl AsRef<Path>,
        options: FetchOptions,
    ) -> Result<FetchOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let candidates: Vec<String> = candidates.into_iter().map(Into::into).collect();
        let destination = destination.as_ref();
        if candidates.is_empty() {
            return Err(Error::NoCandidates);
        }
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let id = RequestId::next();
        let cancel = CancellationToken::new();
        self.active.insert(id, cancel.clone());
        let _registration = ActiveGuard {
            active: &self.active,
            id,
        };

        // Link the caller's token; the drop guard ends the link task with the request
        let _link_done = cancel.clone().drop_guard();
        if let Some(outer) = options.cancel.clone() {
            let request = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = outer.cancelled() => request.cancel(),
                    _ = request.cancelled() => {}
                }
            });
        }

        let client = options.client.clone().unwrap_or_else(|| self.client.clone());
        tracing::debug!(
            request_id = id.0,
            candidates = candidates.len(),
            destination = ?destination,
            "starting fetch"
        );

        let mut failures: Vec<CandidateFailure> = Vec::new();
        for url in candidates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let attempt = Attempt {
                id,
                url: &url,
                destination,
                options: &options,
                client: &client,
                config: &self.config,
                scoreboard: &self.scoreboard,
                cache: &self.cache,
                challenge: &self.challenge,
                events: &self.event_tx,
                cancel: &cancel,
            };

            match attempt.run().await {
                Ok(outcome) => {
                    tracing::info!(
                        request_id = id.0,
                        url = %outcome.url,
                        stage = %outcome.stage,
                        bytes = outcome.bytes,
                        "fetch finished"
                    );
                    return Ok(outcome);
                }
                Err(Error::Cancelled) => {
                    tracing::info!(request_id = id.0, url = %url, "fetch cancelled");
                    return Err(Error::Cancelled);
                }
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => {
                    tracing::warn!(request_id = id.0, url = %url, error = %e, "candidate failed");
                    self.emit_event(Event::CandidateFailed {
                        id,
                        url: url.clone(),
                        error: e.to_string(),
                    });
                    failures.push(CandidateFailure { url, error: e });
                }
            }
        }

        if failures.len() == 1
            && let Some(only) = failures.pop()
        {
            return Err(only.error);
        }

        let err = Error::AllCandidatesFailed(failures);
        tracing::error!(request_id = id.0, error = %err, "every candidate failed");
        Err(err)
    }

    /// Rewrite a canonical URL through the configured provider and fetch it
    ///
    /// Validators are cached under the canonical URL, whichever candidate served it.
    pub async fn fetch_via_provider(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
        mut options: FetchOptions,
    ) -> Result<FetchOutcome> {
        options.cache_key.get_or_insert_with(|| url.to_string());
        let candidates = self.provider.rewrite_with_candidates(url);
        self.fetch(candidates, destination, options).await
    }

    /// Cancel every in-flight request and wait for them to clean up
    ///
    /// Cancelled requests remove their pending files exactly as stalled ones do.
    /// Requests started after shutdown fail with [`Error::Cancelled`].
    pub async fn shutdown(&self) {
        tracing::info!("shutting down download engine");
        self.accepting_new.store(false, Ordering::SeqCst);

        for entry in self.active.iter() {
            entry.value().cancel();
        }

        let wait = async {
            while !self.active.is_empty() {
                tracing::debug!(active = self.active.len(), "waiting for requests to finish");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(std::time::Duration::from_secs(30), wait)
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for requests to finish");
        }
    }

    fn emit_event(&self, event: Event) {
        // send() fails only when nobody is subscribed
        self.event_tx.send(event).ok();
    }
}

/// Removes a request from the active map when its fetch returns or is dropped
struct ActiveGuard<'a> {
    active: &'a DashMap<RequestId, CancellationToken>,
    id: RequestId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}
