//! Test configuration helpers for creating engines with short timeouts

use mirror_dl::{Config, ConditionalCache, DownloadEngine, MirrorScoreboard};
use std::path::Path;
use std::time::Duration;

/// Stall window used by tests; mocks that hang are delayed well past it
pub const TEST_STALL_WINDOW: Duration = Duration::from_millis(800);

/// Configuration with a short stall window, no retries, no probe and a
/// cache file inside `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.transfer.stall_window = TEST_STALL_WINDOW;
    config.transfer.stall_tick = Duration::from_millis(100);
    config.transfer.challenge_probe = false;
    config.transfer.max_connections = 1;
    config.retry.max_attempts = 0;
    config.cache.path = dir.join("conditional-cache.json");
    config
}

/// Engine over `config` with a scoreboard the test keeps a handle to
pub fn engine_with_scoreboard(config: Config) -> (DownloadEngine, MirrorScoreboard) {
    let scoreboard = MirrorScoreboard::new();
    let cache = ConditionalCache::new(config.cache.path.clone());
    let engine = DownloadEngine::with_state(config, scoreboard.clone(), cache)
        .expect("test config is valid");
    (engine, scoreboard)
}
