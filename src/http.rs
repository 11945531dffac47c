//! HTTP client construction and request helpers
//!
//! Timeouts are layered. The client itself carries the connect timeout; the
//! header and body timeouts are applied around `send()` and the body stream by
//! the callers, so that a slow-but-alive body is left to the stall monitor.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::config::Config;
use crate::error::{Error, Result};

/// Build the pooled client an engine uses for every request
pub fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.timeouts.connect)
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .user_agent(config.transfer.user_agent.as_str())
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| Error::Config {
            message: format!("failed to create HTTP client: {e}"),
            key: None,
        })
}

/// Header map from caller-supplied `(name, value)` pairs
///
/// Pairs that are not valid HTTP header names or values are skipped with a warning.
pub fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid request header"),
        }
    }
    map
}

/// Send a request, failing with [`Error::Timeout`] if headers do not arrive in time
pub(crate) async fn send(url: &str, request: RequestBuilder, timeout: Duration) -> Result<Response> {
    match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) if e.is_timeout() => Err(Error::Timeout {
            url: url.to_string(),
            phase: "headers",
        }),
        Ok(Err(e)) => Err(Error::transport(url, e)),
        Err(_) => Err(Error::Timeout {
            url: url.to_string(),
            phase: "headers",
        }),
    }
}

/// Pass 2xx responses through, turn anything else into [`Error::HttpStatus`]
pub(crate) fn ensure_success(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Require a `206 Partial Content` answer to a ranged request
pub(crate) fn ensure_partial(url: &str, response: Response) -> Result<Response> {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        Ok(response)
    } else {
        Err(Error::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        })
    }
}

/// `Content-Type` header as a string
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Whether the response advertises byte-range support
pub fn accepts_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

/// `Content-Length` header; unlike `Response::content_length` this also works for HEAD
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
