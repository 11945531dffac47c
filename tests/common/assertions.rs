//! Custom test assertions for integration tests

use mirror_dl::{Event, Stage};
use std::path::Path;
use tokio::sync::broadcast;

/// Assert that no pending or part file is left next to `destination`
pub fn assert_no_working_files(destination: &Path) {
    let pending = mirror_dl::utils::pending_path(destination);
    assert!(!pending.exists(), "pending file left behind: {pending:?}");
    for i in 0..8 {
        let part = mirror_dl::utils::part_path(destination, i);
        assert!(!part.exists(), "part file left behind: {part:?}");
    }
}

/// Drain every event currently buffered in `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// URLs of `CandidateFailed` events, in emission order
pub fn failed_candidates(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::CandidateFailed { url, .. } => Some(url.clone()),
            _ => None,
        })
        .collect()
}

/// Whether a `StageChanged` event with `stage` was emitted for `url`
pub fn saw_stage(events: &[Event], url: &str, stage: Stage) -> bool {
    events.iter().any(|e| {
        matches!(e, Event::StageChanged { url: u, stage: s, .. } if u == url && *s == stage)
    })
}
