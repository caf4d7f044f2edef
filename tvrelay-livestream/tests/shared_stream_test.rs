// Integration tests for shared TS streams
//
// Processes are faked with `sh -c` profiles so the whole path runs for
// real: lock, spawn, buffer, sessions, failover and teardown.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tvrelay_core::config::{ChannelConfig, Config, FailoverSourceConfig, ProfileConfig};
use tvrelay_core::source::{CatalogResolver, ContentKind, ContentRef, OutputFormat};
use tvrelay_core::store::MemoryStateStore;
use tvrelay_livestream::{
    ClientInfo, FailoverPhase, StreamError, StreamStatus, StreamingInfrastructure,
};

/// Emits ten TS packets every 50ms. A URL containing "bad" dies straight
/// away; one containing "stall" sends a single burst and then goes quiet
/// without closing its output.
const FEED_SCRIPT: &str = "case '{streamUrl}' in *bad*) exit 1;; *stall*) head -c 1880 /dev/zero; exec sleep 30;; esac; \
                           while :; do head -c 1880 /dev/zero; sleep 0.05; done";

fn channel(id: &str, url: &str, failover: &[&str]) -> ChannelConfig {
    ChannelConfig {
        id: id.to_string(),
        title: format!("Channel {id}"),
        kind: ContentKind::Live,
        url: url.to_string(),
        user_agent: None,
        format: OutputFormat::Ts,
        profile: Some("feed".to_string()),
        failover: failover
            .iter()
            .enumerate()
            .map(|(i, url)| FailoverSourceConfig {
                url: (*url).to_string(),
                user_agent: None,
                priority: i as i32,
                auto_matched: false,
                match_quality: 0.0,
            })
            .collect(),
    }
}

fn test_config(hls_root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.streaming.first_byte_timeout_seconds = 1;
    config.streaming.gap_timeout_seconds = 4;
    config.streaming.failover_extension_seconds = 5;
    config.streaming.stall_timeout_seconds = 2;
    config.streaming.grace_period_seconds = 1;
    config.streaming.max_respawns = 0;
    config.streaming.respawn_backoff_ms = 10;
    config.streaming.stop_timeout_seconds = 1;
    config.streaming.poll_interval_ms = 20;
    config.streaming.buffer_ttl_seconds = 2;
    config.hls.root_dir = hls_root.to_string_lossy().into_owned();
    config.profiles = vec![ProfileConfig {
        id: "feed".to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), FEED_SCRIPT.to_string()],
    }];
    config.channels = vec![
        channel("news", "http://a.example/news", &[]),
        channel("sports", "http://bad.example/sports", &["http://b.example/sports"]),
        channel(
            "weather",
            "http://bad.example/weather",
            &["http://bad-b.example/weather", "http://bad-c.example/weather"],
        ),
        channel("cinema", "http://stall.example/cinema", &["http://b.example/cinema"]),
        channel("rain", "http://stall.example/rain", &["http://stall-b.example/rain"]),
    ];
    config
}

fn infrastructure(config: &Config) -> StreamingInfrastructure {
    StreamingInfrastructure::new(
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(CatalogResolver::from_config(config)),
        "node-test",
    )
}

fn client(ip: &str) -> ClientInfo {
    ClientInfo {
        ip: ip.to_string(),
        user_agent: "test-player".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_spawn_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));
    let content = ContentRef::live("news");

    let joins = (0..8).map(|i| {
        let registry = infra.registry.clone();
        let content = content.clone();
        tokio::spawn(async move { registry.join(&content, &client(&format!("10.0.0.{i}"))).await })
    });
    let attachments: Vec<_> = futures::future::join_all(joins)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let key = attachments[0].key.clone();
    assert!(attachments.iter().all(|a| a.key == key));

    let snapshot = infra.registry.process_snapshot(&key).unwrap();
    assert_eq!(snapshot.spawns, 1);
    assert_eq!(infra.registry.sessions().client_count(&key).await.unwrap(), 8);
    assert_eq!(infra.registry.list_active().await.unwrap().len(), 1);

    infra.shutdown().await;
    assert_eq!(
        infra.registry.stream_status(&key).await.unwrap(),
        Some(StreamStatus::Stopped)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_joiner_starts_at_buffer_head() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));
    let content = ContentRef::live("news");

    let mut first = infra.ts.open(&content, &client("10.0.0.1")).await.unwrap();
    for _ in 0..5 {
        first.next_chunk().await.unwrap().unwrap();
    }

    let late = infra.registry.join(&content, &client("10.0.0.2")).await.unwrap();
    assert!(late.session.cursor >= 1, "late joiner must skip existing data");

    let buffer = infra.registry.buffer(&late.key);
    let head = buffer.head().await.unwrap();
    assert!(head >= late.session.cursor);

    // Everything the late joiner reads was written after it attached.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (data, cursor) = buffer.read(late.session.cursor).await.unwrap().unwrap();
    assert!(cursor > late.session.cursor);
    assert_eq!(data.len() % 188, 0);

    infra.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_client_leaving_stops_stream() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));
    let content = ContentRef::live("news");

    let mut feed = infra.ts.open(&content, &client("10.0.0.1")).await.unwrap();
    let key = feed.key.clone();
    feed.next_chunk().await.unwrap().unwrap();
    assert_eq!(
        infra.registry.stream_status(&key).await.unwrap(),
        Some(StreamStatus::Active)
    );

    drop(feed);

    let mut stopped = false;
    for _ in 0..100 {
        if infra.registry.stream_status(&key).await.unwrap() == Some(StreamStatus::Stopped) {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stopped, "stream should stop once the grace period passes");
    assert!(infra.registry.local_stream(&key).is_none());
    assert_eq!(infra.registry.sessions().client_count(&key).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_switches_to_candidate_once() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));
    let content = ContentRef::live("sports");

    // The primary dies immediately; the client still gets data from B.
    let mut feed = infra.ts.open(&content, &client("10.0.0.1")).await.unwrap();
    feed.next_chunk().await.unwrap().unwrap();
    let key = feed.key.clone();

    let state = infra.registry.failover().load(&key).await.unwrap().unwrap();
    assert_eq!(state.phase, FailoverPhase::CandidateActive);
    assert_eq!(state.switch_count, 1);
    assert_eq!(state.current().unwrap().url, "http://b.example/sports");

    let stream = infra.registry.status(&key).await.unwrap().unwrap();
    assert_eq!(stream.status, StreamStatus::Active);
    assert_eq!(
        stream.info.unwrap().current_url,
        "http://b.example/sports"
    );
    // Same key, one entry, one process per source.
    assert_eq!(infra.registry.list_active().await.unwrap().len(), 1);
    assert_eq!(infra.registry.process_snapshot(&key).unwrap().spawns, 2);

    infra.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_failover_returns_terminal_error() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));
    let content = ContentRef::live("weather");

    let err = match infra.ts.open(&content, &client("10.0.0.1")).await {
        Ok(_) => panic!("every source is broken, open must fail"),
        Err(e) => e,
    };
    assert!(
        matches!(err, StreamError::FailoverExhausted(_) | StreamError::SourceUnreachable(_)),
        "unexpected error: {err}"
    );

    let (key, _) = infra.registry.resolve(&content).await.unwrap();
    let stream = infra.registry.status(&key).await.unwrap().unwrap();
    assert_eq!(stream.status, StreamStatus::Error);
    assert_eq!(stream.failover_phase, Some(FailoverPhase::Exhausted));
    assert!(stream.error.is_some());

    // The driver may still be tearing down when the client sees the error.
    let deadline = Instant::now() + Duration::from_secs(3);
    while infra.registry.local_stream(&key).is_some() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(infra.registry.local_stream(&key).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_primary_fails_over_without_dropping_viewer() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    assert!(config.validate().is_ok());
    let infra = infrastructure(&config);

    let mut feed = infra
        .ts
        .open(&ContentRef::live("cinema"), &client("10.0.0.1"))
        .await
        .unwrap();
    feed.next_chunk().await.unwrap().unwrap();
    let key = feed.key.clone();

    // The primary goes quiet after its burst; the same feed keeps flowing
    // once the candidate takes over.
    let mut after_switch = 0;
    let deadline = Instant::now() + Duration::from_secs(15);
    while after_switch < 3 && Instant::now() < deadline {
        let chunk = tokio::time::timeout(Duration::from_secs(10), feed.next_chunk())
            .await
            .expect("viewer should not wait out the failover")
            .expect("feed closed during failover")
            .expect("feed failed during failover");
        assert!(!chunk.is_empty());
        let state = infra.registry.failover().load(&key).await.unwrap().unwrap();
        if state.phase == FailoverPhase::CandidateActive {
            after_switch += 1;
        }
    }
    assert_eq!(after_switch, 3);

    let state = infra.registry.failover().load(&key).await.unwrap().unwrap();
    assert_eq!(state.switch_count, 1);
    assert_eq!(state.current().unwrap().url, "http://b.example/cinema");
    assert_eq!(infra.registry.list_active().await.unwrap().len(), 1);
    assert_eq!(infra.registry.sessions().client_count(&key).await.unwrap(), 1);
    assert_eq!(
        infra.registry.stream_status(&key).await.unwrap(),
        Some(StreamStatus::Active)
    );

    infra.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attached_viewer_gets_error_when_every_source_goes_silent() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));

    let mut feed = infra
        .ts
        .open(&ContentRef::live("rain"), &client("10.0.0.1"))
        .await
        .unwrap();
    feed.next_chunk().await.unwrap().unwrap();
    let key = feed.key.clone();

    let err = loop {
        let next = tokio::time::timeout(Duration::from_secs(15), feed.next_chunk())
            .await
            .expect("feed should end once failover gives up");
        match next {
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e,
            None => panic!("feed closed without telling the viewer why"),
        }
    };
    assert!(matches!(err, StreamError::FailoverExhausted(_)), "unexpected error: {err}");

    let state = infra.registry.failover().load(&key).await.unwrap().unwrap();
    assert_eq!(state.phase, FailoverPhase::Exhausted);
    assert_eq!(state.switch_count, 1);
}

#[tokio::test]
async fn test_ts_open_rejects_unknown_content() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(&test_config(dir.path()));

    let err = infra
        .ts
        .open(&ContentRef::live("missing"), &client("10.0.0.1"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StreamError::StreamNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_failover_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.channels.push(channel(
        "music",
        "http://a.example/music",
        &["http://b.example/music"],
    ));
    let infra = infrastructure(&config);

    let mut feed = infra
        .ts
        .open(&ContentRef::live("music"), &client("10.0.0.1"))
        .await
        .unwrap();
    feed.next_chunk().await.unwrap().unwrap();
    let key = feed.key.clone();

    infra
        .registry
        .request_failover(&key, "health check failed")
        .await
        .unwrap();

    let mut switched = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        feed.next_chunk().await.unwrap().unwrap();
        let state = infra.registry.failover().load(&key).await.unwrap().unwrap();
        if state.phase == FailoverPhase::CandidateActive {
            assert_eq!(state.current().unwrap().url, "http://b.example/music");
            switched = true;
            break;
        }
    }
    assert!(switched, "owner should move to the candidate source");

    infra.shutdown().await;
}
