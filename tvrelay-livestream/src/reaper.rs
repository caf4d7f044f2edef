// Idle reaper
//
// Periodic sweep over the active set. It catches what the per-client
// release path misses: crashed workers that never deregistered, HLS jobs
// (whose pollers are anonymous) and streams left behind by a dead node.
//
// Any node may sweep; every action it takes is idempotent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing as log;
use tvrelay_core::config::ReaperConfig;
use tvrelay_core::source::OutputFormat;

use crate::buffer::hls::channel_name;
use crate::error::StreamResult;
use crate::key::StreamKey;
use crate::model::SharedStream;
use crate::registry::StreamRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub evicted_sessions: usize,
    pub stopped_streams: usize,
    pub purged_streams: usize,
    pub removed_directories: usize,
}

impl ReapReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.evicted_sessions == 0
            && self.stopped_streams == 0
            && self.purged_streams == 0
            && self.removed_directories == 0
    }
}

pub struct IdleReaper {
    registry: StreamRegistry,
    interval: Duration,
    hls_idle_ttl: Duration,
}

impl IdleReaper {
    pub fn new(registry: StreamRegistry, config: &ReaperConfig) -> Self {
        let hls_idle_ttl = Duration::from_secs(registry.hls_config().idle_ttl_seconds);
        Self {
            registry,
            interval: Duration::from_secs(config.interval_seconds.max(1)),
            hls_idle_ttl,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_hls_idle_ttl(mut self, ttl: Duration) -> Self {
        self.hls_idle_ttl = ttl;
        self
    }

    /// Start the background sweep loop.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!(interval_secs = self.interval.as_secs(), "Idle reaper started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match self.sweep().await {
                    Ok(report) if !report.is_empty() => log::info!(?report, "Reaper sweep finished"),
                    Ok(_) => {}
                    Err(e) => log::error!(error = %e, "Reaper sweep failed"),
                }
            }
            log::info!("Idle reaper stopped");
        })
    }

    /// One pass over every known stream and HLS directory.
    pub async fn sweep(&self) -> StreamResult<ReapReport> {
        let mut report = ReapReport::default();

        for key in self.registry.active_keys().await? {
            if let Err(e) = self.sweep_stream(&key, &mut report).await {
                log::warn!(stream_key = %key, error = %e, "Failed to sweep stream");
            }
        }

        report.removed_directories = self.sweep_hls_directories().await?;
        Ok(report)
    }

    async fn sweep_stream(&self, key: &StreamKey, report: &mut ReapReport) -> StreamResult<()> {
        let local = self.registry.local_stream(key).is_some();
        let Some(stream) = self.registry.status(key).await? else {
            // Status lease lapsed: the owning node is gone.
            if !local {
                self.registry.purge(key).await?;
                report.purged_streams += 1;
            }
            return Ok(());
        };

        if stream.status.is_terminal() {
            if !local && !self.registry.is_serving(key).await? {
                self.registry
                    .store()
                    .srem(&self.registry.keys().active_streams(), key.as_str())
                    .await?;
            }
            return Ok(());
        }

        report.evicted_sessions += self.registry.sessions().evict_inactive(key).await?.len();

        let format = stream.info.as_ref().map(|i| i.format).or_else(|| key.format());
        let stopped = match format {
            Some(OutputFormat::Hls) => self.reap_hls(key, &stream).await?,
            _ => self.registry.stop_if_idle(key).await?,
        };
        if stopped {
            report.stopped_streams += 1;
        }
        Ok(())
    }

    /// HLS jobs have no sessions; they live as long as someone keeps
    /// requesting the manifest or segments.
    async fn reap_hls(&self, key: &StreamKey, stream: &SharedStream) -> StreamResult<bool> {
        if !stream.status.is_live() {
            return Ok(false);
        }
        let Some(channel) = hls_channel(key, stream) else {
            return Ok(false);
        };

        let last_seen = match self.registry.hls_last_seen(&channel).await? {
            Some(t) => Some(t),
            None => stream.info.as_ref().map(|i| i.created_at),
        };
        if !is_older_than(last_seen, self.hls_idle_ttl) {
            return Ok(false);
        }

        log::info!(stream_key = %key, channel, "Stopping idle HLS job");
        self.registry.stop(key).await
    }

    /// Remove channel directories no running job writes to.
    async fn sweep_hls_directories(&self) -> StreamResult<usize> {
        let dir = self.registry.hls_directory();
        let mut busy: HashSet<String> = self.registry.local_hls_channels().into_iter().collect();
        for stream in self.registry.list_active().await? {
            if stream.status.is_live() {
                if let Some(channel) = hls_channel(&stream.key, &stream) {
                    busy.insert(channel);
                }
            }
        }

        let mut removed = 0;
        for channel in dir.list_channels().await? {
            if busy.contains(&channel) {
                continue;
            }
            let modified = dir.manifest_modified(&channel).await;
            let last_seen = self.registry.hls_last_seen(&channel).await?;
            if !modified.is_none_or(|m| system_time_older_than(m, self.hls_idle_ttl))
                || !is_older_than(last_seen, self.hls_idle_ttl)
            {
                continue;
            }

            dir.remove(&channel).await?;
            log::info!(channel, "Removed idle HLS directory");
            removed += 1;
        }
        Ok(removed)
    }
}

fn hls_channel(key: &StreamKey, stream: &SharedStream) -> Option<String> {
    stream
        .info
        .as_ref()
        .and_then(|i| i.hls_channel.clone())
        .or_else(|| key.content().map(|c| channel_name(&c)))
}

/// `None` counts as old: nothing has been seen at all.
fn is_older_than(at: Option<DateTime<Utc>>, age: Duration) -> bool {
    at.is_none_or(|t| (Utc::now() - t).to_std().unwrap_or_default() >= age)
}

fn system_time_older_than(at: SystemTime, age: Duration) -> bool {
    at.elapsed().unwrap_or_default() >= age
}
