//! Body transfer into the pending file
//!
//! Every transfer starts with one plain GET. When its headers announce
//! `Accept-Ranges: bytes` and a length at or above the segmented threshold, and
//! more than one connection is allowed, that response is dropped and the body
//! is fetched as concurrent byte ranges into part files, then joined into the
//! pending file. Servers that advertise ranges but answer them with the whole
//! body get a fresh single-stream GET instead. Either way the final
//! destination is never written here.

use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::StreamExt;
use reqwest::header::{HeaderMap, RANGE};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressReporter;
use crate::cache::CacheEntry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http;
use crate::retry::download_with_retry;
use crate::types::{Event, RequestId};
use crate::utils::{part_path, pending_path, remove_quietly};

/// Everything one transfer needs, borrowed from the attempt
pub(super) struct TransferRequest<'a> {
    pub id: RequestId,
    pub events: &'a broadcast::Sender<Event>,
    pub client: &'a reqwest::Client,
    pub url: &'a str,
    pub destination: &'a Path,
    pub headers: &'a HeaderMap,
    pub config: &'a Config,
    pub connections: usize,
    /// Ends retry backoff early; the transfer itself is raced against it by the caller
    pub cancel: &'a CancellationToken,
}

/// Response metadata of a finished transfer
#[derive(Debug)]
pub(super) struct Transferred {
    pub bytes: u64,
    pub latency_ms: u64,
    pub status: u16,
    pub content_type: Option<String>,
    pub validators: Option<CacheEntry>,
}

struct RangePlan {
    total: u64,
    latency_ms: u64,
    content_type: Option<String>,
    validators: Option<CacheEntry>,
}

/// Files a transfer for `destination` may write, for the stall monitor and cleanup
pub(super) fn working_files(destination: &Path, connections: usize) -> Vec<PathBuf> {
    let mut files = vec![pending_path(destination)];
    files.extend((0..connections.max(1)).map(|i| part_path(destination, i)));
    files
}

/// Transfer the body of `req.url` into the pending file
pub(super) async fn run(req: &TransferRequest<'_>) -> Result<Transferred> {
    let (response, latency_ms) = open(req).await?;

    if req.connections > 1
        && let Some(plan) = plan_ranges(req, &response, latency_ms)
    {
        drop(response);
        tracing::debug!(
            url = req.url,
            total = plan.total,
            connections = req.connections,
            "using segmented transfer"
        );
        match segmented(req, plan).await {
            Err(e) if range_ignored(&e) => {
                tracing::debug!(url = req.url, error = %e, "ranges ignored, using single stream");
                for i in 0..req.connections {
                    remove_quietly(&part_path(req.destination, i)).await;
                }
                let (response, latency_ms) = open(req).await?;
                return single(req, response, latency_ms).await;
            }
            result => return result,
        }
    }
    single(req, response, latency_ms).await
}

impl<'a> TransferRequest<'a> {
    fn reporter(&self, total: Option<u64>) -> ProgressReporter<'a> {
        ProgressReporter::new(
            self.events,
            self.id,
            self.url,
            total,
            self.config.transfer.progress_interval,
        )
    }
}

/// Send the plain GET; returns the response and its header latency
async fn open(req: &TransferRequest<'_>) -> Result<(reqwest::Response, u64)> {
    let started = Instant::now();
    let response = download_with_retry(&req.config.retry, req.cancel, || async move {
        let request = req.client.get(req.url).headers(req.headers.clone());
        let response = http::send(req.url, request, req.config.timeouts.headers).await?;
        http::ensure_success(req.url, response)
    })
    .await?;
    Ok((response, started.elapsed().as_millis() as u64))
}

async fn single(
    req: &TransferRequest<'_>,
    response: reqwest::Response,
    latency_ms: u64,
) -> Result<Transferred> {
    let status = response.status().as_u16();
    let content_type = http::content_type(response.headers());
    let validators = CacheEntry::from_headers(response.headers());
    let reporter = req.reporter(response.content_length());

    let pending = pending_path(req.destination);
    let mut file = tokio::fs::File::create(&pending).await?;
    let body = write_body(req.url, response, &mut file, &reporter);
    match tokio::time::timeout(req.config.timeouts.body, body).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Timeout {
                url: req.url.to_string(),
                phase: "body",
            });
        }
    };
    drop(file);

    Ok(Transferred {
        bytes: reporter.finish(),
        latency_ms,
        status,
        content_type,
        validators,
    })
}

/// Decide from the GET's headers whether a ranged transfer is worthwhile
fn plan_ranges(
    req: &TransferRequest<'_>,
    response: &reqwest::Response,
    latency_ms: u64,
) -> Option<RangePlan> {
    let headers = response.headers();
    let total = http::declared_length(headers)?;
    let threshold = req.config.transfer.segmented_threshold;
    if !http::accepts_ranges(headers) || total == 0 || total < threshold {
        return None;
    }

    Some(RangePlan {
        total,
        latency_ms,
        content_type: http::content_type(headers),
        validators: CacheEntry::from_headers(headers),
    })
}

/// A range request answered with a full-body success status
fn range_ignored(error: &Error) -> bool {
    matches!(error, Error::HttpStatus { status, .. } if (200..300).contains(status))
}

async fn segmented(req: &TransferRequest<'_>, plan: RangePlan) -> Result<Transferred> {
    let reporter = req.reporter(Some(plan.total));
    let ranges = split_ranges(plan.total, req.connections);
    let parts: Vec<PathBuf> = (0..ranges.len())
        .map(|i| part_path(req.destination, i))
        .collect();

    let segments = ranges
        .iter()
        .zip(&parts)
        .map(|(&(start, end), part)| fetch_segment(req, part, start, end, &reporter));
    let body = futures::future::try_join_all(segments);
    match tokio::time::timeout(req.config.timeouts.body, body).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Timeout {
                url: req.url.to_string(),
                phase: "body",
            });
        }
    };

    join_parts(&parts, &pending_path(req.destination)).await?;

    Ok(Transferred {
        bytes: reporter.finish(),
        latency_ms: plan.latency_ms,
        status: 200,
        content_type: plan.content_type,
        validators: plan.validators,
    })
}

async fn fetch_segment(
    req: &TransferRequest<'_>,
    part: &Path,
    start: u64,
    end: u64,
    reporter: &ProgressReporter<'_>,
) -> Result<()> {
    let response = download_with_retry(&req.config.retry, req.cancel, || async move {
        let request = req
            .client
            .get(req.url)
            .headers(req.headers.clone())
            .header(RANGE, format!("bytes={start}-{end}"));
        let response = http::send(req.url, request, req.config.timeouts.headers).await?;
        http::ensure_partial(req.url, response)
    })
    .await?;

    let mut file = tokio::fs::File::create(part).await?;
    let written = write_body(req.url, response, &mut file, reporter).await?;
    let expected = end - start + 1;
    if written != expected {
        return Err(Error::SizeMismatch {
            path: req.destination.to_path_buf(),
            expected,
            actual: written,
        });
    }
    Ok(())
}

async fn write_body(
    url: &str,
    response: reqwest::Response,
    file: &mut tokio::fs::File,
    reporter: &ProgressReporter<'_>,
) -> Result<u64> {
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::transport(url, e))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        reporter.add(chunk.len() as u64);
    }
    file.flush().await?;
    Ok(written)
}

async fn join_parts(parts: &[PathBuf], pending: &Path) -> Result<()> {
    let mut out = tokio::fs::File::create(pending).await?;
    for part in parts {
        let mut input = tokio::fs::File::open(part).await?;
        tokio::io::copy(&mut input, &mut out).await?;
        drop(input);
        remove_quietly(part).await;
    }
    out.flush().await?;
    Ok(())
}

/// Inclusive byte ranges covering `0..total` in at most `connections` pieces
fn split_ranges(total: u64, connections: usize) -> Vec<(u64, u64)> {
    let count = (connections.max(1) as u64).min(total.max(1));
    let chunk = total / count;
    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == count {
                total.saturating_sub(1)
            } else {
                start + chunk - 1
            };
            (start, end)
        })
        .collect()
}
