//! Throttled progress reporting for one attempt

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::types::{Event, RequestId};

/// Counts bytes written for one attempt and emits [`Event::Progress`] at most
/// once per interval
///
/// Segments of a ranged transfer share one reporter; they are polled from the
/// request's task, so events still leave in order.
pub(super) struct ProgressReporter<'a> {
    events: &'a broadcast::Sender<Event>,
    id: RequestId,
    url: &'a str,
    total: Option<u64>,
    interval: Duration,
    bytes: AtomicU64,
    last_emit: Mutex<Option<Instant>>,
}

impl<'a> ProgressReporter<'a> {
    pub(super) fn new(
        events: &'a broadcast::Sender<Event>,
        id: RequestId,
        url: &'a str,
        total: Option<u64>,
        interval: Duration,
    ) -> Self {
        Self {
            events,
            id,
            url,
            total,
            interval,
            bytes: AtomicU64::new(0),
            last_emit: Mutex::new(None),
        }
    }

    /// Account for `n` more bytes
    pub(super) fn add(&self, n: u64) {
        let bytes = self.bytes.fetch_add(n, Ordering::Relaxed) + n;
        let due = match self.last_emit.lock() {
            Ok(mut last) => {
                let due = last.is_none_or(|at| at.elapsed() >= self.interval);
                if due {
                    *last = Some(Instant::now());
                }
                due
            }
            Err(_) => false,
        };
        if due {
            self.emit(bytes);
        }
    }

    /// Emit the final count unconditionally
    pub(super) fn finish(&self) -> u64 {
        let bytes = self.bytes();
        self.emit(bytes);
        bytes
    }

    pub(super) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn emit(&self, bytes: u64) {
        self.events
            .send(Event::Progress {
                id: self.id,
                url: self.url.to_string(),
                bytes,
                total: self.total,
            })
            .ok();
    }
}
