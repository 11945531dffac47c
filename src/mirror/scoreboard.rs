//! Rolling latency/failure statistics per network origin
//!
//! The scoreboard is the only state shared by every concurrent request. Each
//! origin's entry is updated under its own shard lock, so concurrent updates to
//! different origins never contend and updates to the same origin never tear.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Latency assumed for origins with no successful sample
pub const NEUTRAL_LATENCY_MS: f64 = 5000.0;

/// Score penalty per recorded failure
pub const FAILURE_PENALTY_MS: f64 = 10_000.0;

/// Statistics for one origin
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorScore {
    /// `scheme://host:port`
    pub origin_key: String,
    /// Number of latency samples folded into the average
    pub sample_count: u64,
    /// Running mean of successful request latency
    pub average_latency_ms: f64,
    /// Number of recorded failures
    pub failure_count: u64,
    /// Time of the last success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time of the last failure
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl MirrorScore {
    fn new(origin_key: String) -> Self {
        Self {
            origin_key,
            sample_count: 0,
            average_latency_ms: NEUTRAL_LATENCY_MS,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
        }
    }

    /// Composite ranking score; lower is better
    pub fn score(&self) -> f64 {
        self.average_latency_ms + self.failure_count as f64 * FAILURE_PENALTY_MS
    }
}

/// Process-wide table of [`MirrorScore`]s keyed by origin
///
/// Cloning is cheap and every clone shares the same table.
#[derive(Clone, Debug, Default)]
pub struct MirrorScoreboard {
    scores: Arc<DashMap<String, MirrorScore>>,
}

impl MirrorScoreboard {
    /// Create an empty scoreboard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a successful request's latency into the origin's running average
    pub fn record_success(&self, url: &str, latency_ms: u64) {
        let key = origin_key(url);
        let mut entry = self
            .scores
            .entry(key.clone())
            .or_insert_with(|| MirrorScore::new(key));
        let n = entry.sample_count as f64;
        let average = if entry.sample_count == 0 {
            latency_ms as f64
        } else {
            (entry.average_latency_ms * n + latency_ms as f64) / (n + 1.0)
        };
        entry.average_latency_ms = average;
        entry.sample_count += 1;
        entry.last_success_at = Some(Utc::now());
        tracing::trace!(origin = %entry.origin_key, latency_ms, average, "recorded mirror success");
    }

    /// Count a failure against the origin; latency is left untouched
    pub fn record_failure(&self, url: &str) {
        let key = origin_key(url);
        let mut entry = self
            .scores
            .entry(key.clone())
            .or_insert_with(|| MirrorScore::new(key));
        entry.failure_count += 1;
        entry.last_failure_at = Some(Utc::now());
        tracing::trace!(origin = %entry.origin_key, failures = entry.failure_count, "recorded mirror failure");
    }

    /// Current score of the origin serving `url`, if it has been seen
    pub fn snapshot(&self, url: &str) -> Option<MirrorScore> {
        self.scores.get(&origin_key(url)).map(|s| s.value().clone())
    }

    /// Stable-sort URLs by score; equal scores keep their input order
    pub fn rank(&self, urls: &[String]) -> Vec<String> {
        let mut scored: Vec<(f64, &String)> = urls
            .iter()
            .map(|url| (self.score_of(url), url))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.into_iter().map(|(_, url)| url.clone()).collect()
    }

    fn score_of(&self, url: &str) -> f64 {
        self.scores
            .get(&origin_key(url))
            .map(|s| s.score())
            .unwrap_or(NEUTRAL_LATENCY_MS)
    }
}

/// `scheme://host:port` of a URL; unparsable input is used verbatim
pub fn origin_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", parsed.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", parsed.scheme(), host),
            _ => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}
