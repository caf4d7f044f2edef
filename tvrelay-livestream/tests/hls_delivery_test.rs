// Integration tests for HLS delivery and the idle reaper

use std::sync::Arc;
use std::time::Duration;
use tvrelay_core::config::{ChannelConfig, Config, ProfileConfig};
use tvrelay_core::source::{CatalogResolver, ContentKind, ContentRef, OutputFormat};
use tvrelay_core::store::MemoryStateStore;
use tvrelay_livestream::buffer::hls::channel_name;
use tvrelay_livestream::delivery::hls::MANIFEST_CONTENT_TYPE;
use tvrelay_livestream::{IdleReaper, StreamError, StreamStatus, StreamingInfrastructure};

/// Writes a playlist and one segment, then keeps touching the playlist.
const SEGMENTER_SCRIPT: &str = "printf 'segment' > '{outputDir}/segment_00001.ts'; \
    printf '#EXTM3U\\n#EXT-X-TARGETDURATION:4\\n#EXTINF:4.0,\\nsegment_00001.ts\\n' > '{outputDir}/stream.m3u8'; \
    while :; do sleep 0.1; touch '{outputDir}/stream.m3u8'; done";

/// Writes a playlist that names the upstream it was started for.
const LABELLED_SCRIPT: &str = "printf '#EXTM3U\\n#URL {streamUrl}\\n' > '{outputDir}/stream.m3u8'; exec sleep 30";

/// Never writes anything.
const SILENT_SCRIPT: &str = "exec sleep 30";

fn channel(id: &str, profile: &str) -> ChannelConfig {
    ChannelConfig {
        id: id.to_string(),
        title: String::new(),
        kind: ContentKind::Live,
        url: format!("http://a.example/{id}.m3u8"),
        user_agent: None,
        format: OutputFormat::Hls,
        profile: Some(profile.to_string()),
        failover: Vec::new(),
    }
}

fn profile(id: &str, script: &str) -> ProfileConfig {
    ProfileConfig {
        id: id.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

fn infrastructure(hls_root: &std::path::Path) -> StreamingInfrastructure {
    let mut config = Config::default();
    config.streaming.first_byte_timeout_seconds = 5;
    config.streaming.stall_timeout_seconds = 5;
    config.streaming.max_respawns = 0;
    config.streaming.stop_timeout_seconds = 1;
    config.streaming.poll_interval_ms = 20;
    config.hls.root_dir = hls_root.to_string_lossy().into_owned();
    config.hls.manifest_attempts = 20;
    config.hls.manifest_poll_interval_ms = 100;
    config.profiles = vec![
        profile("segmenter", SEGMENTER_SCRIPT),
        profile("silent", SILENT_SCRIPT),
        profile("labelled", LABELLED_SCRIPT),
    ];
    config.channels = vec![
        channel("news", "segmenter"),
        channel("quiet", "silent"),
        channel("a.b", "labelled"),
        channel("a_b", "labelled"),
    ];

    StreamingInfrastructure::new(
        &config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(CatalogResolver::from_config(&config)),
        "node-test",
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manifest_served_once_written() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(dir.path());
    let content = ContentRef::live("news");

    let channel = channel_name(&content);

    let manifest = infra.hls.manifest(&content).await.unwrap();
    assert_eq!(manifest.channel, channel);
    assert!(manifest.body.starts_with(b"#EXTM3U"));
    assert_eq!(MANIFEST_CONTENT_TYPE, "application/vnd.apple.mpegurl");
    assert!(dir.path().join(&channel).join("stream.m3u8").exists());

    let segment = infra.hls.segment(&content, "segment_00001.ts").await.unwrap();
    assert_eq!(&segment[..], b"segment");

    // A second request reuses the running job.
    infra.hls.manifest(&content).await.unwrap();
    assert_eq!(infra.registry.process_snapshot(&manifest.key).unwrap().spawns, 1);
    assert!(infra.registry.hls_last_seen(&channel).await.unwrap().is_some());

    infra.shutdown().await;
    let finalized = tokio::fs::read_to_string(dir.path().join(&channel).join("stream.m3u8"))
        .await
        .unwrap();
    assert!(finalized.trim_end().ends_with("#EXT-X-ENDLIST"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_similar_channel_ids_get_separate_directories() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(dir.path());

    let dotted = infra.hls.manifest(&ContentRef::live("a.b")).await.unwrap();
    let underscored = infra.hls.manifest(&ContentRef::live("a_b")).await.unwrap();
    assert_ne!(dotted.channel, underscored.channel);
    assert_ne!(dotted.key, underscored.key);

    // Starting the second job must not wipe the first one's playlist.
    let dotted_again = infra.hls.manifest(&ContentRef::live("a.b")).await.unwrap();
    let text = String::from_utf8(dotted_again.body.to_vec()).unwrap();
    assert!(text.contains("#URL http://a.example/a.b.m3u8"), "{text}");
    let text = String::from_utf8(underscored.body.to_vec()).unwrap();
    assert!(text.contains("#URL http://a.example/a_b.m3u8"), "{text}");

    let mut channels = infra.registry.hls_directory().list_channels().await.unwrap();
    channels.sort();
    let mut expected = vec![dotted.channel, underscored.channel];
    expected.sort();
    assert_eq!(channels, expected);

    infra.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manifest_not_ready_after_bounded_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(dir.path());
    let hls = infra.hls.clone().with_polling(3, Duration::from_millis(50));

    let err = hls.manifest(&ContentRef::live("quiet")).await.unwrap_err();
    assert!(matches!(err, StreamError::ManifestNotReady { attempts: 3 }));

    infra.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_segment_requests_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(dir.path());
    let content = ContentRef::live("news");

    let err = infra.hls.segment(&content, "../secrets.ts").await.unwrap_err();
    assert!(matches!(err, StreamError::InvalidState(_)));

    let err = infra.hls.segment(&content, "segment_09999.ts").await.unwrap_err();
    assert!(matches!(err, StreamError::StreamNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reaper_stops_idle_hls_job_and_removes_directory() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(dir.path());
    let manifest = infra.hls.manifest(&ContentRef::live("news")).await.unwrap();

    let reaper = IdleReaper::new(infra.registry.clone(), &Default::default())
        .with_hls_idle_ttl(Duration::ZERO);
    let report = reaper.sweep().await.unwrap();

    assert_eq!(report.stopped_streams, 1);
    assert_eq!(report.removed_directories, 1);
    assert_eq!(
        infra.registry.stream_status(&manifest.key).await.unwrap(),
        Some(StreamStatus::Stopped)
    );
    assert!(!dir.path().join(channel_name(&ContentRef::live("news"))).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reaper_keeps_recently_seen_job() {
    let dir = tempfile::tempdir().unwrap();
    let infra = infrastructure(dir.path());
    let manifest = infra.hls.manifest(&ContentRef::live("news")).await.unwrap();

    let reaper = IdleReaper::new(infra.registry.clone(), &Default::default())
        .with_hls_idle_ttl(Duration::from_secs(60));
    let report = reaper.sweep().await.unwrap();

    assert!(report.is_empty());
    let status = infra.registry.stream_status(&manifest.key).await.unwrap();
    assert!(status.is_some_and(StreamStatus::is_live));

    infra.shutdown().await;
}
