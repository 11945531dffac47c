use super::*;
use crate::types::{Checksum, Stage};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.transfer.stall_window = Duration::from_millis(600);
    config.transfer.stall_tick = Duration::from_millis(100);
    config.transfer.challenge_probe = false;
    config.transfer.max_connections = 1;
    config.retry.max_attempts = 0;
    config.cache.path = dir.join("cache.json");
    config
}

fn engine(dir: &Path) -> DownloadEngine {
    DownloadEngine::new(test_config(dir)).unwrap()
}

fn sha1_hex(bytes: &[u8]) -> String {
    use sha1::Digest;
    format!("{:x}", sha1::Sha1::digest(bytes))
}

/// Serves `bytes=a-b` ranges of a fixed body
struct RangeResponder(Vec<u8>);

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
        match range {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{end}/{}", self.0.len()).as_str(),
                )
                .set_body_bytes(self.0[start..=end].to_vec()),
            None => ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.0.clone()),
        }
    }
}

fn stages(rx: &mut broadcast::Receiver<Event>) -> Vec<Stage> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::StageChanged { stage, .. } = event {
            out.push(stage);
        }
    }
    out
}

#[tokio::test]
async fn stage_events_follow_state_machine() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
        .mount(&server)
        .await;

    let engine = engine(dir.path());
    let mut rx = engine.subscribe();
    let dest = dir.path().join("out").join("a.bin");
    let outcome = engine
        .fetch([format!("{}/a.bin", server.uri())], &dest, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.stage, Stage::Succeeded);
    assert_eq!(outcome.bytes, 7);
    assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    assert_eq!(
        stages(&mut rx),
        vec![
            Stage::Pending,
            Stage::CacheCheck,
            Stage::Transferring,
            Stage::Validating,
            Stage::Succeeded
        ]
    );
}

#[tokio::test]
async fn probe_stage_is_reported_when_enabled() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 1, 2]))
        .mount(&server)
        .await;

    let mut config = test_config(dir.path());
    config.transfer.challenge_probe = true;
    let engine = DownloadEngine::new(config).unwrap();
    let mut rx = engine.subscribe();
    engine
        .fetch([format!("{}/a.bin", server.uri())], dir.path().join("a.bin"), FetchOptions::default())
        .await
        .unwrap();

    assert!(stages(&mut rx).contains(&Stage::Probing));
}

#[tokio::test]
async fn segmented_transfer_joins_parts_in_order() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder(body.clone()))
        .mount(&server)
        .await;

    let mut config = test_config(dir.path());
    config.transfer.segmented_threshold = 1024;
    config.transfer.max_connections = 4;
    let engine = DownloadEngine::new(config).unwrap();

    let dest = dir.path().join("big.bin");
    let options = FetchOptions::with_checksum(Checksum::sha1(sha1_hex(&body)));
    let outcome = engine
        .fetch([format!("{}/big.bin", server.uri())], &dest, options)
        .await
        .unwrap();

    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    for i in 0..4 {
        assert!(!crate::utils::part_path(&dest, i).exists());
    }

    let requests = server.received_requests().await.unwrap();
    let ranged = requests.iter().filter(|r| r.headers.contains_key("range")).count();
    assert_eq!(ranged, 4);
    assert!(requests.iter().all(|r| r.method.as_str() == "GET"));
}

#[tokio::test]
async fn ignored_ranges_fall_back_to_single_stream() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
    let server = MockServer::start().await;
    // Advertises ranges but always answers with the whole body
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;

    let mut config = test_config(dir.path());
    config.transfer.segmented_threshold = 1024;
    config.transfer.max_connections = 4;
    let engine = DownloadEngine::new(config).unwrap();

    let url = format!("{}/big.bin", server.uri());
    let dest = dir.path().join("big.bin");
    let outcome = engine
        .fetch([url.clone()], &dest, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.stage, Stage::Succeeded);
    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    for i in 0..4 {
        assert!(!crate::utils::part_path(&dest, i).exists());
    }
    assert_eq!(engine.scoreboard().snapshot(&url).unwrap().failure_count, 0);
}

#[tokio::test]
async fn small_files_need_no_extra_request() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(b"tiny".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(dir.path());
    config.transfer.max_connections = 4;
    let engine = DownloadEngine::new(config).unwrap();

    engine
        .fetch([format!("{}/tiny", server.uri())], dir.path().join("tiny"), FetchOptions::default())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method.as_str(), "GET");
}

#[tokio::test]
async fn validators_are_stored_and_used() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_bytes(b"v1 body".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine(dir.path());
    let url = format!("{}/data.json", server.uri());
    let dest = dir.path().join("data.json");

    let first = engine.fetch([url.clone()], &dest, FetchOptions::default()).await.unwrap();
    assert_eq!(first.stage, Stage::Succeeded);
    assert_eq!(
        engine.cache().get(&url).await.unwrap().etag.as_deref(),
        Some("\"v1\"")
    );

    let second = engine.fetch([url.clone()], &dest, FetchOptions::default()).await.unwrap();
    assert_eq!(second.stage, Stage::SkippedUnchanged);
    assert_eq!(second.bytes, 0);
    assert_eq!(engine.scoreboard().snapshot(&url).unwrap().sample_count, 2);
}

#[tokio::test]
async fn response_without_validators_clears_stale_entry() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .mount(&server)
        .await;

    let engine = engine(dir.path());
    let url = format!("{}/a.txt", server.uri());
    engine
        .cache()
        .set(&url, crate::cache::CacheEntry::new(Some("\"old\"".into()), None))
        .await;

    engine
        .fetch([url.clone()], dir.path().join("a.txt"), FetchOptions::default())
        .await
        .unwrap();
    assert!(engine.cache().get(&url).await.is_none());
}

#[tokio::test]
async fn archive_destination_gets_post_download_challenge_check() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<!DOCTYPE html><title>Just a moment...</title>"),
        )
        .mount(&server)
        .await;

    let engine = engine(dir.path());
    let dest = dir.path().join("mod.jar");
    let err = engine
        .fetch([format!("{}/mod.jar", server.uri())], &dest, FetchOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ChallengeDetected { status: Some(200), .. }));
    assert!(!dest.exists());
    assert!(!crate::utils::pending_path(&dest).exists());
}

#[tokio::test]
async fn size_mismatch_fails_candidate() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 10]))
        .mount(&server)
        .await;

    let engine = engine(dir.path());
    let options = FetchOptions {
        expected_size: Some(11),
        ..Default::default()
    };
    let dest = dir.path().join("x.bin");
    let err = engine
        .fetch([format!("{}/x.bin", server.uri())], &dest, options)
        .await
        .unwrap_err();
    match err {
        Error::SizeMismatch { path, expected, actual } => {
            assert_eq!(path, dest);
            assert_eq!((expected, actual), (11, 10));
        }
        other => panic!("expected a size mismatch, got {other}"),
    }
}

#[tokio::test]
async fn empty_candidate_list_is_rejected() {
    let dir = TempDir::new().unwrap();
    let err = engine(dir.path())
        .fetch(Vec::<String>::new(), dir.path().join("x"), FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCandidates));
}

#[tokio::test]
async fn outer_cancellation_stops_without_blaming_mirror() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let mut config = test_config(dir.path());
    config.transfer.stall_window = Duration::from_secs(10);
    config.transfer.stall_tick = Duration::from_secs(1);
    let engine = DownloadEngine::new(config).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let url = format!("{}/slow.bin", server.uri());
    let dest = dir.path().join("slow.bin");
    let options = FetchOptions {
        cancel: Some(cancel),
        ..Default::default()
    };
    let started = std::time::Instant::now();
    let err = engine
        .fetch([url.clone(), format!("{}/other.bin", server.uri())], &dest, options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!crate::utils::pending_path(&dest).exists());
    assert!(engine.scoreboard().snapshot(&url).is_none());
}

#[tokio::test]
async fn shutdown_cancels_in_flight_and_rejects_new_requests() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let mut config = test_config(dir.path());
    config.transfer.stall_window = Duration::from_secs(10);
    config.transfer.stall_tick = Duration::from_secs(1);
    let engine = DownloadEngine::new(config).unwrap();

    let running = {
        let engine = engine.clone();
        let url = format!("{}/slow.bin", server.uri());
        let dest = dir.path().join("slow.bin");
        tokio::spawn(async move { engine.fetch([url], dest, FetchOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .unwrap();
    assert!(matches!(running.await.unwrap(), Err(Error::Cancelled)));

    let err = engine
        .fetch([format!("{}/late", server.uri())], dir.path().join("late"), FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn fetch_via_provider_uses_rewritten_candidates() {
    let dir = TempDir::new().unwrap();
    let mirror = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maven/org/example/lib/1.0/lib-1.0.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"lib\"")
                .set_body_bytes(b"from mirror".to_vec()),
        )
        .mount(&mirror)
        .await;

    let mut config = test_config(dir.path());
    config.mirror.mode = crate::mirror::MirrorMode::Mirror;
    config.mirror.maven_roots = vec!["https://repo.example.org/maven2".to_string()];
    config.mirror.maven_mirrors = vec![format!("{}/maven", mirror.uri())];
    config.mirror.rules = Vec::new();
    let engine = DownloadEngine::new(config).unwrap();

    let canonical = "https://repo.example.org/maven2/org/example/lib/1.0/lib-1.0.txt";
    let dest = dir.path().join("lib-1.0.txt");
    let outcome = engine
        .fetch_via_provider(canonical, &dest, FetchOptions::default())
        .await
        .unwrap();

    assert!(outcome.url.starts_with(&mirror.uri()));
    assert_eq!(std::fs::read(&dest).unwrap(), b"from mirror");

    // Validators are stored under the canonical URL, not the mirror that served them
    let cached = engine.cache().get(canonical).await.unwrap();
    assert_eq!(cached.etag.as_deref(), Some("\"lib\""));
    assert!(engine.cache().get(&outcome.url).await.is_none());
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.transfer.stall_tick = Duration::ZERO;
    assert!(matches!(
        DownloadEngine::new(config).unwrap_err(),
        Error::Config { .. }
    ));
}
