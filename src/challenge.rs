//! Detection of anti-bot interstitial pages served in place of a payload
//!
//! CDNs in front of some mirrors answer with `200 OK` and an HTML "checking
//! your browser" page. Both the pre-flight probe and the post-download check
//! use [`looks_like_challenge`] on a short leading snippet.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::RANGE;
use tokio::io::AsyncReadExt;

use crate::config::TransferConfig;

/// Phrases that identify a challenge page (matched case-insensitively)
pub const CHALLENGE_PHRASES: &[&str] = &[
    "verifying your browser",
    "attention required",
    "cloudflare",
    "js required",
    "enable javascript",
    "browser verification",
];

/// Result of a pre-flight probe
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// Whether the candidate serves a challenge page
    pub blocked: bool,
    /// Status of the probe response, if one arrived
    pub status: Option<u16>,
    /// Content-Type of the probe response, if one arrived
    pub content_type: Option<String>,
}

/// Heuristic test of a response's content type and leading bytes
pub fn looks_like_challenge(content_type: Option<&str>, snippet: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            return true;
        }
    }

    // Binary payloads routinely contain arbitrary byte runs; only inspect text
    if snippet.contains(&0) {
        return false;
    }

    let text = String::from_utf8_lossy(snippet).to_lowercase();
    let head = text.trim_start_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return true;
    }
    CHALLENGE_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Probe and snippet checks with the configured sizes and timeout
#[derive(Clone, Debug)]
pub struct ChallengeDetector {
    probe_bytes: usize,
    probe_timeout: Duration,
}

impl ChallengeDetector {
    /// Detector inspecting `probe_bytes` leading bytes, giving up on probes after `probe_timeout`
    pub fn new(probe_bytes: usize, probe_timeout: Duration) -> Self {
        Self {
            probe_bytes,
            probe_timeout,
        }
    }

    /// Detector built from the transfer settings
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.probe_bytes, config.probe_timeout)
    }

    /// Ranged GET of the first bytes of `url`
    ///
    /// Network failures and timeouts yield a not-blocked result so that the
    /// real transfer gets to report them.
    pub async fn probe(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: &reqwest::header::HeaderMap,
    ) -> ProbeResult {
        match tokio::time::timeout(self.probe_timeout, self.probe_inner(client, url, headers)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "challenge probe failed, continuing");
                ProbeResult::default()
            }
            Err(_) => {
                tracing::debug!(url, "challenge probe timed out, continuing");
                ProbeResult::default()
            }
        }
    }

    async fn probe_inner(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: &reqwest::header::HeaderMap,
    ) -> Result<ProbeResult, reqwest::Error> {
        let last = self.probe_bytes.saturating_sub(1);
        let response = client
            .get(url)
            .headers(headers.clone())
            .header(RANGE, format!("bytes=0-{last}"))
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = crate::http::content_type(response.headers());

        let mut snippet = Vec::with_capacity(self.probe_bytes.min(64 * 1024));
        let mut stream = response.bytes_stream();
        while snippet.len() < self.probe_bytes {
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    let take = chunk.len().min(self.probe_bytes - snippet.len());
                    snippet.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }

        let blocked = looks_like_challenge(content_type.as_deref(), &snippet);
        if blocked {
            tracing::warn!(url, status, content_type = ?content_type, "probe found a challenge page");
        }
        Ok(ProbeResult {
            blocked,
            status: Some(status),
            content_type,
        })
    }

    /// Inspect the leading bytes of a finished download
    pub async fn check_file(&self, path: &Path) -> std::io::Result<bool> {
        let file = tokio::fs::File::open(path).await?;
        let mut snippet = Vec::with_capacity(self.probe_bytes);
        file.take(self.probe_bytes as u64)
            .read_to_end(&mut snippet)
            .await?;
        Ok(looks_like_challenge(None, &snippet))
    }
}
