// Stream driver
//
// One task per locally owned stream. Runs the supervisor against the active
// source, feeds the buffer, and walks the failover chain when a source
// fails. Exactly one driver exists per stream key cluster-wide; it is the
// only writer of the stream's info, status and failover records.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tvrelay_core::source::{OutputFormat, OutputTemplate, ResolvedSource};

use super::{RegistryInner, CONTROL_INTERVAL, STATUS_LEASE};
use crate::buffer::BufferWriter;
use crate::error::{StreamError, StreamResult};
use crate::failover::FailoverState;
use crate::key::StreamKey;
use crate::model::{HealthStatus, SharedStreamInfo, StreamStatus};
use crate::supervisor::{
    ProcessCommand, ProcessEvent, ProcessObserver, ProcessState, ProcessSupervisor, RunOutcome,
    SourceTarget, SupervisorSettings,
};

const INFO_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

enum DriveEnd {
    Stopped,
    Completed,
    Failed(StreamError),
}

pub(super) struct StreamDriver {
    pub(super) ctx: Arc<RegistryInner>,
    pub(super) key: StreamKey,
    pub(super) source: ResolvedSource,
    pub(super) template: Option<OutputTemplate>,
    pub(super) hls_channel: Option<String>,
    pub(super) cancel: CancellationToken,
    pub(super) process: Arc<ProcessState>,
    pub(super) info: SharedStreamInfo,
    pub(super) ready: Option<oneshot::Sender<StreamResult<()>>>,
}

impl StreamDriver {
    pub(super) async fn run(mut self) {
        let (switch_tx, mut switch_rx) = mpsc::channel(1);
        let control = tokio::spawn(watch_control(
            Arc::clone(&self.ctx),
            self.key.clone(),
            self.cancel.clone(),
            switch_tx,
        ));

        let mut writer = None;
        let end = match self.drive(&mut writer, &mut switch_rx).await {
            Ok(end) => end,
            Err(e) => DriveEnd::Failed(e),
        };

        control.abort();
        self.finish(end, writer).await;
    }

    async fn drive(
        &mut self,
        writer: &mut Option<BufferWriter>,
        switch_rx: &mut mpsc::Receiver<String>,
    ) -> StreamResult<DriveEnd> {
        let ctx = Arc::clone(&self.ctx);

        if self.source.format == OutputFormat::Ts {
            *writer = Some(
                BufferWriter::open(
                    Arc::clone(&ctx.store),
                    ctx.keys.clone(),
                    self.key.clone(),
                    &ctx.streaming,
                )
                .await?,
            );
        }

        let primary = SourceTarget {
            url: self.source.url().to_string(),
            user_agent: self.source.user_agent().to_string(),
        };
        let mut failover = ctx
            .failover
            .init(&self.key, primary, self.source.source.resolve_failover_candidates())
            .await?;

        let (output_dir, manifest): (Option<PathBuf>, Option<PathBuf>) = match &self.hls_channel {
            Some(channel) => (
                Some(ctx.hls_dir.channel_dir(channel)?),
                Some(ctx.hls_dir.manifest_path(channel)?),
            ),
            None => (None, None),
        };

        let supervisor = ProcessSupervisor::new(
            SupervisorSettings::from(&ctx.streaming),
            Arc::clone(&self.process),
        );
        let ends_naturally = self.source.source.ends_naturally();
        let mut meter = BandwidthMeter::new();

        loop {
            let target = failover
                .current()
                .map(|s| s.target())
                .ok_or_else(|| StreamError::Internal("failover index out of range".to_string()))?;
            let command = ProcessCommand::for_stream(
                self.source.format,
                self.template.as_ref(),
                &ctx.streaming.ffmpeg_path,
                &target,
                output_dir.as_deref(),
                &ctx.hls,
            );

            let run_cancel = self.cancel.child_token();
            let mut manual_switch = None;
            let outcome = {
                let mut sink = DriverSink {
                    ctx: &ctx,
                    key: &self.key,
                    writer: writer.as_mut(),
                    failover: &mut failover,
                    info: &mut self.info,
                    ready: &mut self.ready,
                    meter: &mut meter,
                    first_output: false,
                    last_flush: Instant::now(),
                };
                let run = supervisor.run(
                    &command,
                    manifest.as_deref(),
                    ends_naturally,
                    &mut sink,
                    &run_cancel,
                );
                tokio::pin!(run);

                tokio::select! {
                    outcome = &mut run => outcome,
                    Some(reason) = switch_rx.recv() => {
                        log::warn!(stream_key = %self.key, reason = %reason, "Failover requested");
                        manual_switch = Some(reason);
                        run_cancel.cancel();
                        (&mut run).await
                    }
                }
            };

            let failure = match outcome {
                RunOutcome::Stopped if self.cancel.is_cancelled() => return Ok(DriveEnd::Stopped),
                RunOutcome::Stopped => match manual_switch {
                    Some(reason) => StreamError::SourceUnreachable(format!("failover requested: {reason}")),
                    None => return Ok(DriveEnd::Stopped),
                },
                RunOutcome::Completed => return Ok(DriveEnd::Completed),
                RunOutcome::Failed(e) if !e.is_source_failure() => return Ok(DriveEnd::Failed(e)),
                RunOutcome::Failed(e) => e,
            };

            let message = failure.to_string();
            ctx.store
                .set(&ctx.keys.error(self.key.as_str()), &message, None)
                .await?;

            let next = ctx.failover.begin_switch(&self.key, &mut failover, &message).await?;
            ctx.set_status(&self.key, StreamStatus::Error).await?;

            match next {
                Some(target) => {
                    self.info.current_url = target.url;
                    self.info.health = HealthStatus::Degraded;
                    self.info.pid = None;
                    ctx.write_info(&self.key, &self.info).await?;
                }
                None if failover.sources.len() > 1 => {
                    return Ok(DriveEnd::Failed(StreamError::FailoverExhausted(format!(
                        "all {} sources failed, last: {message}",
                        failover.sources.len()
                    ))));
                }
                None => return Ok(DriveEnd::Failed(failure)),
            }
        }
    }

    async fn finish(mut self, end: DriveEnd, writer: Option<BufferWriter>) {
        let ctx = Arc::clone(&self.ctx);
        let key = self.key.clone();
        let k = key.as_str();

        let (status, failure) = match end {
            DriveEnd::Stopped | DriveEnd::Completed => (StreamStatus::Stopped, None),
            DriveEnd::Failed(e) => (StreamStatus::Error, Some(e)),
        };

        if let Some(e) = &failure {
            let attempted: Vec<String> = match ctx.failover.load(&key).await {
                Ok(Some(state)) => state.attempted_urls().iter().map(ToString::to_string).collect(),
                _ => vec![self.info.primary_url.clone()],
            };
            log::error!(
                stream_key = %key,
                channel = %self.info.content.id,
                attempted_sources = ?attempted,
                diagnostics = ?self.process.diagnostics(),
                error = %e,
                "Shared stream failed"
            );
            if let Err(store_err) = ctx.store.set(&ctx.keys.error(k), &e.to_string(), None).await {
                log::warn!(stream_key = %key, error = %store_err, "Failed to record stream error");
            }
            self.info.health = HealthStatus::Failing;
        } else {
            log::info!(stream_key = %key, "Shared stream stopped");
        }

        self.info.pid = None;
        if let Err(e) = ctx.write_info(&key, &self.info).await {
            log::warn!(stream_key = %key, error = %e, "Failed to write final stream info");
        }

        let client_count = ctx.sessions.client_count(&key).await.unwrap_or(0);
        if let Some(mut writer) = writer {
            if let Err(e) = writer.release(client_count > 0).await {
                log::warn!(stream_key = %key, error = %e, "Failed to release buffer");
            }
        }
        if let Some(channel) = &self.hls_channel {
            if let Err(e) = ctx.hls_dir.finalize_manifest(channel).await {
                log::warn!(stream_key = %key, channel, error = %e, "Failed to finalize manifest");
            }
        }

        ctx.local
            .remove_if(k, |_, local| Arc::ptr_eq(&local.process, &self.process));

        if let Err(e) = self.release_state(status, client_count).await {
            log::error!(stream_key = %key, error = %e, "Failed to release stream state");
        }

        if let Some(ready) = self.ready.take() {
            let err = failure.unwrap_or_else(|| {
                StreamError::SourceUnreachable(format!("stream {key} stopped before starting"))
            });
            let _ = ready.send(Err(err));
        }
    }

    /// Hand the stream's keys over to expiry. Runs once the process is gone.
    async fn release_state(&self, status: StreamStatus, client_count: i64) -> StreamResult<()> {
        let ctx = &self.ctx;
        let k = self.key.as_str();
        let ttl = Duration::from_secs(ctx.streaming.buffer_ttl_seconds.max(1));

        ctx.store.delete(&[ctx.keys.stop(k), ctx.keys.switch(k)]).await?;
        if client_count == 0 {
            ctx.store
                .delete(&[ctx.keys.clients(k), ctx.keys.sessions(k)])
                .await?;
        }
        ctx.store.srem(&ctx.keys.active_streams(), k).await?;

        ctx.set_status(&self.key, status).await?;
        for state_key in [
            ctx.keys.info(k),
            ctx.keys.error(k),
            ctx.keys.failover(k),
            ctx.keys.bytes(k),
            ctx.keys.last_activity(k),
        ] {
            ctx.store.expire(&state_key, ttl).await?;
        }
        Ok(())
    }
}

/// Observer for one supervisor run: writes output into the buffer and keeps
/// the shared records current.
struct DriverSink<'a> {
    ctx: &'a RegistryInner,
    key: &'a StreamKey,
    writer: Option<&'a mut BufferWriter>,
    failover: &'a mut FailoverState,
    info: &'a mut SharedStreamInfo,
    ready: &'a mut Option<oneshot::Sender<StreamResult<()>>>,
    meter: &'a mut BandwidthMeter,
    first_output: bool,
    last_flush: Instant,
}

impl DriverSink<'_> {
    async fn on_first_output(&mut self) -> StreamResult<()> {
        self.first_output = true;
        self.ctx.set_status(self.key, StreamStatus::Active).await?;
        self.ctx
            .failover
            .confirm_active(self.key, &mut *self.failover)
            .await?;
        self.info.health = HealthStatus::Healthy;
        self.ctx.write_info(self.key, &*self.info).await
    }

    async fn maybe_flush(&mut self) -> StreamResult<()> {
        if self.last_flush.elapsed() < INFO_FLUSH_INTERVAL {
            return Ok(());
        }
        self.last_flush = Instant::now();

        if let Some(writer) = self.writer.as_deref_mut() {
            let min_cursor = self.ctx.sessions.min_cursor(self.key).await?;
            writer.prune(min_cursor).await?;
        }
        self.info.bandwidth_bps = self.meter.rate();
        self.ctx.write_info(self.key, &*self.info).await
    }
}

#[async_trait]
impl ProcessObserver for DriverSink<'_> {
    async fn on_event(&mut self, event: ProcessEvent) -> StreamResult<()> {
        match event {
            ProcessEvent::Spawned { pid, attempt } => {
                self.info.pid = pid;
                if attempt > 0 {
                    self.info.restarts += 1;
                    self.info.health = HealthStatus::Degraded;
                }
                self.first_output = false;
                self.ctx.write_info(self.key, &*self.info).await?;
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            ProcessEvent::Data(chunk) => {
                // Go active before the first chunk becomes readable.
                if !self.first_output {
                    self.on_first_output().await?;
                }
                self.append(chunk).await?;
                self.maybe_flush().await?;
            }
            ProcessEvent::Progress => {
                if !self.first_output {
                    self.on_first_output().await?;
                }
                self.maybe_flush().await?;
            }
            ProcessEvent::Exited { .. } => {
                self.info.pid = None;
            }
        }
        Ok(())
    }
}

impl DriverSink<'_> {
    async fn append(&mut self, chunk: Bytes) -> StreamResult<()> {
        let len = chunk.len();
        if let Some(writer) = self.writer.as_deref_mut() {
            writer.append(chunk).await?;
        }
        self.ctx
            .store
            .incr_by(&self.ctx.keys.bytes(self.key.as_str()), len as i64)
            .await?;
        self.meter.record(len);
        Ok(())
    }
}

/// Rolling ingest rate over roughly the last few seconds.
struct BandwidthMeter {
    window_start: Instant,
    window_bytes: u64,
    rate: u64,
}

impl BandwidthMeter {
    const WINDOW: Duration = Duration::from_secs(5);

    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            rate: 0,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.window_bytes += bytes as u64;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Self::WINDOW {
            self.rate = (self.window_bytes as f64 * 8.0 / elapsed.as_secs_f64()) as u64;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    /// Bits per second.
    fn rate(&self) -> u64 {
        if self.rate > 0 {
            return self.rate;
        }
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.window_bytes as f64 * 8.0 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Owner-side control loop: honours stop and switch requests written by any
/// node, and renews the status lease while the driver is alive.
async fn watch_control(
    ctx: Arc<RegistryInner>,
    key: StreamKey,
    cancel: CancellationToken,
    switch_tx: mpsc::Sender<String>,
) {
    let mut ticker = tokio::time::interval(CONTROL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = control_tick(&ctx, &key, &cancel, &switch_tx).await {
            log::warn!(stream_key = %key, error = %e, "Stream control tick failed");
        }
    }
}

async fn control_tick(
    ctx: &RegistryInner,
    key: &StreamKey,
    cancel: &CancellationToken,
    switch_tx: &mpsc::Sender<String>,
) -> StreamResult<()> {
    let k = key.as_str();

    if let Some(requested_by) = ctx.store.get(&ctx.keys.stop(k)).await? {
        log::info!(stream_key = %key, requested_by, "Stop requested");
        cancel.cancel();
        return Ok(());
    }

    if let Some(reason) = ctx.store.get(&ctx.keys.switch(k)).await? {
        ctx.store.delete(&[ctx.keys.switch(k)]).await?;
        if switch_tx.try_send(reason).is_err() {
            log::debug!(stream_key = %key, "Failover already pending");
        }
    }

    match ctx.read_status(key).await? {
        Some(StreamStatus::Starting | StreamStatus::Active | StreamStatus::Error) => {
            ctx.store.expire(&ctx.keys.status(k), STATUS_LEASE).await?;
        }
        _ => {}
    }
    Ok(())
}
