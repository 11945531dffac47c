//! One candidate attempt
//!
//! `Pending → CacheCheck → (SkippedUnchanged | Probing) → Transferring → Validating → (Succeeded | Failed)`
//!
//! Whatever the outcome, [`Attempt::run`] removes the pending and part files in
//! one place after the attempt settles. The destination itself is only touched
//! by the final rename of a validated file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::transfer::{self, TransferRequest, Transferred};
use crate::cache::{CacheEntry, ConditionalCache};
use crate::challenge::ChallengeDetector;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http;
use crate::integrity;
use crate::mirror::MirrorScoreboard;
use crate::stall::StallMonitor;
use crate::types::{Event, FetchOptions, FetchOutcome, RequestId, Stage};
use crate::utils::{pending_path, remove_quietly};

pub(super) struct Attempt<'a> {
    pub id: RequestId,
    pub url: &'a str,
    pub destination: &'a Path,
    pub options: &'a FetchOptions,
    pub client: &'a reqwest::Client,
    pub config: &'a Config,
    pub scoreboard: &'a MirrorScoreboard,
    pub cache: &'a ConditionalCache,
    pub challenge: &'a ChallengeDetector,
    pub events: &'a broadcast::Sender<Event>,
    /// Request-level token (outer cancellation and engine shutdown)
    pub cancel: &'a CancellationToken,
}

impl Attempt<'_> {
    pub(super) async fn run(&self) -> Result<FetchOutcome> {
        self.stage(Stage::Pending);
        let connections = self
            .options
            .max_connections
            .unwrap_or(self.config.transfer.max_connections)
            .max(1);

        let result = self.drive(connections).await;

        for path in transfer::working_files(self.destination, connections) {
            remove_quietly(&path).await;
        }

        if let Err(e) = &result {
            // Cancellation says nothing about the mirror
            if !matches!(e, Error::Cancelled) {
                self.scoreboard.record_failure(self.url);
            }
            self.stage(Stage::Failed);
        }
        result
    }

    async fn drive(&self, connections: usize) -> Result<FetchOutcome> {
        let headers = http::header_map(&self.options.headers);

        self.stage(Stage::CacheCheck);
        if let Some(latency_ms) = self.check_unchanged(&headers).await? {
            self.scoreboard.record_success(self.url, latency_ms);
            self.stage(Stage::SkippedUnchanged);
            tracing::info!(
                request_id = self.id.0,
                url = self.url,
                destination = ?self.destination,
                "destination unchanged, skipping transfer"
            );
            return Ok(self.outcome(Stage::SkippedUnchanged, 0));
        }

        let archive =
            integrity::archive_validation_applies(self.destination, self.options.validate_archive);
        let probed =
            self.config.transfer.challenge_probe && self.options.checksum.is_none() && !archive;
        if probed {
            self.stage(Stage::Probing);
            let probe = self
                .cancellable(async { Ok(self.challenge.probe(self.client, self.url, &headers).await) })
                .await?;
            if probe.blocked {
                return Err(Error::ChallengeDetected {
                    url: self.url.to_string(),
                    status: probe.status,
                    content_type: probe.content_type,
                });
            }
        }

        self.stage(Stage::Transferring);
        if let Some(parent) = self.destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Leftovers of an interrupted run are never resumed
        let working = transfer::working_files(self.destination, connections);
        for path in &working {
            remove_quietly(path).await;
        }
        let transferred = self.supervised_transfer(&headers, connections, working).await?;

        self.stage(Stage::Validating);
        let pending = pending_path(self.destination);
        self.cancellable(self.validate(&pending, &transferred, probed, archive))
            .await?;

        tokio::fs::rename(&pending, self.destination).await?;
        self.scoreboard.record_success(self.url, transferred.latency_ms);
        match transferred.validators {
            Some(entry) => self.cache.set(self.cache_key(), entry).await,
            // Stale validators would make a later check skip a changed file
            None => self.cache.remove(self.cache_key()).await,
        }

        self.stage(Stage::Succeeded);
        Ok(self.outcome(Stage::Succeeded, transferred.bytes))
    }

    /// Conditional HEAD against the cached validators
    ///
    /// Returns the request latency when the server answers `304 Not Modified`.
    /// Failures of the check are not fatal; the transfer runs instead.
    async fn check_unchanged(&self, headers: &HeaderMap) -> Result<Option<u64>> {
        if !tokio::fs::try_exists(self.destination).await.unwrap_or(false) {
            return Ok(None);
        }
        let cached = self.cache.get(self.cache_key()).await;
        let Some(entry) = cached.filter(CacheEntry::has_validator) else {
            tracing::debug!(url = self.url, "no cached validators");
            return Ok(None);
        };

        let mut conditional = headers.clone();
        if let Some(etag) = &entry.etag
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            conditional.insert(IF_NONE_MATCH, value);
        }
        if let Some(modified) = &entry.last_modified
            && let Ok(value) = HeaderValue::from_str(modified)
        {
            conditional.insert(IF_MODIFIED_SINCE, value);
        }

        let started = Instant::now();
        let request = self.client.head(self.url).headers(conditional);
        let response = self
            .cancellable(async {
                Ok(http::send(self.url, request, self.config.transfer.probe_timeout).await)
            })
            .await?;

        match response {
            Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
                let fresh = CacheEntry::from_headers(response.headers());
                let refreshed = CacheEntry::new(
                    fresh.as_ref().and_then(|f| f.etag.clone()).or(entry.etag),
                    fresh
                        .and_then(|f| f.last_modified)
                        .or(entry.last_modified),
                );
                self.cache.set(self.cache_key(), refreshed).await;
                Ok(Some(started.elapsed().as_millis() as u64))
            }
            Ok(response) => {
                tracing::debug!(url = self.url, status = response.status().as_u16(), "cache miss");
                Ok(None)
            }
            Err(e) => {
                tracing::debug!(url = self.url, error = %e, "conditional check failed, transferring");
                Ok(None)
            }
        }
    }

    /// Run the transfer under a stall monitor sharing one cancellation token
    async fn supervised_transfer(
        &self,
        headers: &HeaderMap,
        connections: usize,
        working: Vec<PathBuf>,
    ) -> Result<Transferred> {
        let token = self.cancel.child_token();
        let monitor = StallMonitor::from_config(working, &self.config.transfer).spawn(token.clone());

        let request = TransferRequest {
            id: self.id,
            events: self.events,
            client: self.client,
            url: self.url,
            destination: self.destination,
            headers,
            config: self.config,
            connections,
            cancel: &token,
        };
        let result = tokio::select! {
            result = transfer::run(&request) => result,
            _ = token.cancelled() => Err(Error::Cancelled),
        };

        let stalled = monitor.stop().await;
        match result {
            Ok(transferred) => Ok(transferred),
            Err(_) if stalled => Err(Error::Stalled {
                url: self.url.to_string(),
                window: self.config.transfer.stall_window,
            }),
            Err(_) if self.cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(e),
        }
    }

    /// Challenge, archive, size and checksum checks, in that order
    async fn validate(
        &self,
        pending: &Path,
        transferred: &Transferred,
        probed: bool,
        archive: bool,
    ) -> Result<()> {
        if !probed && self.options.checksum.is_none() && self.challenge.check_file(pending).await? {
            return Err(Error::ChallengeDetected {
                url: self.url.to_string(),
                status: Some(transferred.status),
                content_type: transferred.content_type.clone(),
            });
        }

        if archive {
            integrity::validate_archive(pending)
                .await
                .map_err(|e| self.at_destination(e))?;
        }

        if let Some(expected) = self.options.expected_size {
            let actual = tokio::fs::metadata(pending).await?.len();
            if actual != expected {
                return Err(Error::SizeMismatch {
                    path: self.destination.to_path_buf(),
                    expected,
                    actual,
                });
            }
        }

        if let Some(checksum) = &self.options.checksum {
            integrity::validate_checksum(pending, checksum)
                .await
                .map_err(|e| self.at_destination(e))?;
        }
        Ok(())
    }

    /// Point a validation error at the destination; the pending file is gone
    /// by the time the caller sees it
    fn at_destination(&self, error: Error) -> Error {
        let path = self.destination.to_path_buf();
        match error {
            Error::ChecksumMismatch { expected, actual, .. } => Error::ChecksumMismatch {
                path,
                expected,
                actual,
            },
            Error::ArchiveCorrupt { reason, .. } => Error::ArchiveCorrupt { path, reason },
            other => other,
        }
    }

    /// Conditional-cache key: the caller's canonical URL, else this candidate
    fn cache_key(&self) -> &str {
        self.options.cache_key.as_deref().unwrap_or(self.url)
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    fn stage(&self, stage: Stage) {
        tracing::debug!(request_id = self.id.0, url = self.url, %stage, "stage changed");
        self.events
            .send(Event::StageChanged {
                id: self.id,
                url: self.url.to_string(),
                stage,
            })
            .ok();
    }

    fn outcome(&self, stage: Stage, bytes: u64) -> FetchOutcome {
        FetchOutcome {
            id: self.id,
            url: self.url.to_string(),
            stage,
            bytes,
        }
    }
}
