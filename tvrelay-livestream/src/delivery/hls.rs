// HLS delivery
//
// The channel directory on disk is the source of truth: no cursors, no
// sessions. A manifest request starts the job if needed and polls a bounded
// number of times for the playlist to appear. Every request refreshes the
// channel's last-seen marker, which is what keeps the job alive.

use bytes::Bytes;
use std::time::Duration;
use tracing as log;
use tvrelay_core::source::{ContentKind, ContentRef, OutputFormat};

use crate::buffer::hls::{channel_name, is_valid_segment_name};
use crate::error::{StreamError, StreamResult};
use crate::key::StreamKey;
use crate::model::StreamStatus;
use crate::registry::StreamRegistry;

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/MP2T";

#[derive(Debug, Clone)]
pub struct HlsManifest {
    pub key: StreamKey,
    pub channel: String,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct HlsDelivery {
    registry: StreamRegistry,
    attempts: u32,
    interval: Duration,
}

impl HlsDelivery {
    pub fn new(registry: StreamRegistry) -> Self {
        let hls = registry.hls_config();
        let attempts = hls.manifest_attempts.max(1);
        let interval = Duration::from_millis(hls.manifest_poll_interval_ms);
        Self {
            registry,
            attempts,
            interval,
        }
    }

    #[must_use]
    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }

    /// Serve the current manifest for `content`, starting the job if no one
    /// is producing it.
    pub async fn manifest(&self, content: &ContentRef) -> StreamResult<HlsManifest> {
        let (key, resolved) = self.registry.resolve(content).await?;
        if resolved.format != OutputFormat::Hls {
            return Err(StreamError::InvalidState(format!(
                "{} {} is delivered as {}",
                content.kind, content.id, resolved.format
            )));
        }

        let channel = channel_name(content);
        self.registry.touch_hls(&channel).await?;

        if !self.is_finished_vod(&key, content, &channel).await? {
            self.registry.get_or_create(&key, &resolved).await?;
        }

        let dir = self.registry.hls_directory();
        for attempt in 1..=self.attempts {
            if let Some(body) = dir.read_manifest(&channel).await? {
                if attempt > 1 {
                    log::debug!(stream_key = %key, channel, attempt, "Manifest ready");
                }
                return Ok(HlsManifest { key, channel, body });
            }
            if let Some(e) = self.registry.terminal_error(&key).await? {
                return Err(e);
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        log::info!(stream_key = %key, channel, attempts = self.attempts, "Manifest not ready");
        Err(StreamError::ManifestNotReady {
            attempts: self.attempts,
        })
    }

    /// A finished on-demand job leaves a complete playlist behind; serve it
    /// instead of transcoding the item again.
    async fn is_finished_vod(&self, key: &StreamKey, content: &ContentRef, channel: &str) -> StreamResult<bool> {
        if content.kind != ContentKind::OnDemand {
            return Ok(false);
        }
        let stopped = self.registry.stream_status(key).await? == Some(StreamStatus::Stopped);
        Ok(stopped && self.registry.hls_directory().manifest_exists(channel).await)
    }

    /// Serve one segment file. Segments are never generated on demand.
    pub async fn segment(&self, content: &ContentRef, name: &str) -> StreamResult<Bytes> {
        if !is_valid_segment_name(name) {
            return Err(StreamError::InvalidState(format!("invalid segment name: {name}")));
        }

        let channel = channel_name(content);
        self.registry.touch_hls(&channel).await?;
        self.registry
            .hls_directory()
            .read_segment(&channel, name)
            .await?
            .ok_or_else(|| StreamError::StreamNotFound(format!("{channel}/{name}")))
    }
}
