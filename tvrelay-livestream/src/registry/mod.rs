// Stream registry
//
// The single join entry point. `get_or_create` guarantees at most one
// process per stream key, across workers and nodes:
// - fast path: status is live -> attach
// - otherwise take stream:{key}:lock (SET NX with TTL), re-check, create
// - losers poll until the winner's stream is visible, then attach
//
// Shared state lives in the StateStore. Process handles are node-local and
// kept in `local`; only the owning node ever touches its process.
//
// Teardown is decided here, never by a disconnecting worker: `release`
// schedules a delayed idle check once the client count reaches zero, and
// the reaper sweeps whatever that misses.

mod driver;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{self as log, Instrument};
use tvrelay_core::config::{HlsConfig, StreamingConfig};
use tvrelay_core::source::{ContentRef, OutputFormat, ResolvedSource, SourceResolver};
use tvrelay_core::store::{Keys, StateStore};

use crate::buffer::hls::channel_name;
use crate::buffer::{ChunkBuffer, HlsDirectory};
use crate::error::{StreamError, StreamResult};
use crate::failover::{FailoverPhase, FailoverResolver};
use crate::key::StreamKey;
use crate::model::{
    ClientInfo, ClientSession, HealthStatus, SharedStream, SharedStreamInfo, StreamStatus,
};
use crate::session::SessionTracker;
use crate::supervisor::{ProcessSnapshot, ProcessState};

use self::driver::StreamDriver;

/// How often the owner checks for stop/switch requests and renews its lease.
const CONTROL_INTERVAL: Duration = Duration::from_secs(1);

/// A live status key expires unless its owner keeps renewing it, so a dead
/// node's streams become re-creatable. Tolerates four missed renewals.
const STATUS_LEASE: Duration = Duration::from_secs(5);

/// A client attached to a TS stream.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub key: StreamKey,
    pub session: ClientSession,
    pub format: OutputFormat,
}

/// Node-local handle of a stream whose process runs here.
pub struct LocalStream {
    pub key: StreamKey,
    pub format: OutputFormat,
    pub hls_channel: Option<String>,
    cancel: CancellationToken,
    process: Arc<ProcessState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalStream {
    #[must_use]
    pub fn process(&self) -> ProcessSnapshot {
        self.process.snapshot()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }
}

pub(crate) struct RegistryInner {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) keys: Keys,
    pub(crate) node_id: String,
    pub(crate) streaming: StreamingConfig,
    pub(crate) hls: HlsConfig,
    pub(crate) hls_dir: HlsDirectory,
    pub(crate) resolver: Arc<dyn SourceResolver>,
    pub(crate) sessions: SessionTracker,
    pub(crate) failover: FailoverResolver,
    pub(crate) local: DashMap<String, Arc<LocalStream>>,
}

impl RegistryInner {
    /// Write a status with the TTL its state calls for.
    pub(crate) async fn set_status(&self, key: &StreamKey, status: StreamStatus) -> StreamResult<()> {
        let ttl = match status {
            StreamStatus::Starting | StreamStatus::Active => STATUS_LEASE,
            StreamStatus::Stopping => self.streaming.stop_timeout() * 3,
            StreamStatus::Stopped | StreamStatus::Error => {
                Duration::from_secs(self.streaming.buffer_ttl_seconds.max(1))
            }
        };
        self.store
            .set(&self.keys.status(key.as_str()), status.as_str(), Some(ttl))
            .await?;
        Ok(())
    }

    pub(crate) async fn read_status(&self, key: &StreamKey) -> StreamResult<Option<StreamStatus>> {
        Ok(self
            .store
            .get(&self.keys.status(key.as_str()))
            .await?
            .and_then(|s| s.parse().ok()))
    }

    pub(crate) async fn write_info(&self, key: &StreamKey, info: &SharedStreamInfo) -> StreamResult<()> {
        let json = serde_json::to_string(info)?;
        self.store
            .set(&self.keys.info(key.as_str()), &json, None)
            .await?;
        Ok(())
    }

    pub(crate) async fn touch_hls(&self, channel: &str) -> StreamResult<()> {
        let ttl = Duration::from_secs(self.hls.idle_ttl_seconds.max(1) * 4);
        self.store
            .set(&self.keys.hls_last_seen(channel), &Utc::now().to_rfc3339(), Some(ttl))
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        keys: Keys,
        resolver: Arc<dyn SourceResolver>,
        node_id: impl Into<String>,
        streaming: StreamingConfig,
        hls: HlsConfig,
    ) -> Self {
        let failover = FailoverResolver::new(Arc::clone(&store), keys.clone());
        let sessions = SessionTracker::new(
            Arc::clone(&store),
            keys.clone(),
            failover.clone(),
            streaming.client_inactivity(),
        );
        let hls_dir = HlsDirectory::new(&hls.root_dir);

        Self {
            inner: Arc::new(RegistryInner {
                store,
                keys,
                node_id: node_id.into(),
                streaming,
                hls,
                hls_dir,
                resolver,
                sessions,
                failover,
                local: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionTracker {
        &self.inner.sessions
    }

    #[must_use]
    pub fn failover(&self) -> &FailoverResolver {
        &self.inner.failover
    }

    #[must_use]
    pub fn hls_directory(&self) -> &HlsDirectory {
        &self.inner.hls_dir
    }

    #[must_use]
    pub fn streaming_config(&self) -> &StreamingConfig {
        &self.inner.streaming
    }

    #[must_use]
    pub fn hls_config(&self) -> &HlsConfig {
        &self.inner.hls
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn keys(&self) -> &Keys {
        &self.inner.keys
    }

    #[must_use]
    pub fn buffer(&self, key: &StreamKey) -> ChunkBuffer {
        ChunkBuffer::new(
            Arc::clone(&self.inner.store),
            self.inner.keys.clone(),
            key.clone(),
            &self.inner.streaming,
        )
    }

    /// Resolve content to its source and derive the stream key.
    pub async fn resolve(&self, content: &ContentRef) -> StreamResult<(StreamKey, ResolvedSource)> {
        let resolved = self.inner.resolver.resolve_source(content).await?;
        let key = StreamKey::derive(content, resolved.url(), resolved.format);
        Ok((key, resolved))
    }

    /// Attach a client to the shared stream for `content`, creating the
    /// stream if needed. The client's cursor starts at the current buffer
    /// head.
    pub async fn join(&self, content: &ContentRef, client: &ClientInfo) -> StreamResult<Attachment> {
        let (key, resolved) = self.resolve(content).await?;
        self.attach(&key, &resolved, client).await
    }

    /// `join` for a source that is already resolved.
    pub async fn attach(
        &self,
        key: &StreamKey,
        resolved: &ResolvedSource,
        client: &ClientInfo,
    ) -> StreamResult<Attachment> {
        self.get_or_create(key, resolved).await?;

        let cursor = self.buffer(key).head().await?;
        let session = self.inner.sessions.register(key, client, cursor).await?;
        Ok(Attachment {
            key: key.clone(),
            session,
            format: resolved.format,
        })
    }

    /// Return the live stream for `key`, creating it if none exists.
    pub async fn get_or_create(
        &self,
        key: &StreamKey,
        source: &ResolvedSource,
    ) -> StreamResult<SharedStream> {
        let lock_key = self.inner.keys.lock(key.as_str());
        let lock_ttl = self.inner.streaming.lock_ttl();
        let deadline = Instant::now() + lock_ttl * 2 + self.inner.streaming.stop_timeout() * 3;
        let mut waited_on_other = false;

        loop {
            let status = self.inner.read_status(key).await?;
            if self.is_attachable(key, status).await? {
                if let Some(stream) = self.status(key).await? {
                    return Ok(stream);
                }
            }

            // A waiter only gives up once the creator has released the lock,
            // so a stale error from an earlier run is not mistaken for this one.
            if waited_on_other
                && status == Some(StreamStatus::Error)
                && self.inner.store.get(&lock_key).await?.is_none()
            {
                let cause = self.error_cause(key).await?;
                return Err(StreamError::SourceUnreachable(cause));
            }

            if status != Some(StreamStatus::Stopping) {
                let token = format!("{}:{}", self.inner.node_id, uuid::Uuid::new_v4());
                if self.inner.store.set_nx(&lock_key, &token, lock_ttl).await? {
                    let result = self.create_locked(key, source).await;
                    if let Err(e) = self.inner.store.compare_and_delete(&lock_key, &token).await {
                        log::warn!(stream_key = %key, error = %e, "Failed to release creation lock");
                    }
                    return result;
                }
                waited_on_other = true;
            }

            if Instant::now() >= deadline {
                return Err(StreamError::InvalidState(format!(
                    "timed out waiting for stream {key} to start"
                )));
            }
            tokio::time::sleep(self.inner.streaming.poll_interval()).await;
        }
    }

    /// Live streams are attachable, and so is a stream in error that is
    /// mid-failover: the swap is invisible to clients.
    async fn is_attachable(&self, key: &StreamKey, status: Option<StreamStatus>) -> StreamResult<bool> {
        match status {
            Some(s) if s.is_live() => Ok(true),
            Some(StreamStatus::Error) => self.inner.failover.is_in_progress(key).await,
            _ => Ok(false),
        }
    }

    pub async fn stream_status(&self, key: &StreamKey) -> StreamResult<Option<StreamStatus>> {
        self.inner.read_status(key).await
    }

    /// Whether readers of `key` should keep waiting for data.
    pub async fn is_serving(&self, key: &StreamKey) -> StreamResult<bool> {
        let status = self.inner.read_status(key).await?;
        self.is_attachable(key, status).await
    }

    /// The error attached clients should receive, if the stream has failed
    /// for good. A failure in the middle of a source swap is not terminal.
    pub async fn terminal_error(&self, key: &StreamKey) -> StreamResult<Option<StreamError>> {
        if self.inner.read_status(key).await? != Some(StreamStatus::Error) {
            return Ok(None);
        }
        let state = self.inner.failover.load(key).await?;
        if state.as_ref().is_some_and(|s| s.phase == FailoverPhase::Switching) {
            return Ok(None);
        }
        // A candidate going live flips the status before the phase, so a
        // confirmed phase seen here may belong to a stream that is Active again.
        if self.inner.read_status(key).await? != Some(StreamStatus::Error) {
            return Ok(None);
        }

        let cause = self.error_cause(key).await?;
        let exhausted = state
            .as_ref()
            .is_some_and(|s| s.phase == FailoverPhase::Exhausted && s.sources.len() > 1);
        Ok(Some(if exhausted {
            StreamError::FailoverExhausted(cause)
        } else {
            StreamError::SourceUnreachable(cause)
        }))
    }

    async fn error_cause(&self, key: &StreamKey) -> StreamResult<String> {
        Ok(self
            .inner
            .store
            .get(&self.inner.keys.error(key.as_str()))
            .await?
            .unwrap_or_else(|| format!("stream {key} failed to start")))
    }

    /// Create the stream. Must be called with the creation lock held.
    async fn create_locked(&self, key: &StreamKey, source: &ResolvedSource) -> StreamResult<SharedStream> {
        let status = self.inner.read_status(key).await?;
        if self.is_attachable(key, status).await? {
            if let Some(stream) = self.status(key).await? {
                return Ok(stream);
            }
        }

        let inner = &self.inner;
        let template = match &source.profile_id {
            Some(profile_id) => {
                let template = inner.resolver.resolve_stream_profile(profile_id).await?;
                if template.is_none() {
                    log::warn!(stream_key = %key, profile_id, "Unknown stream profile, using default command");
                }
                template
            }
            None => None,
        };

        let hls_channel = (source.format == OutputFormat::Hls).then(|| channel_name(source.content()));
        if let Some(channel) = &hls_channel {
            inner.hls_dir.prepare(channel).await?;
            inner.touch_hls(channel).await?;
        }

        let k = key.as_str();
        inner
            .store
            .delete(&[
                inner.keys.stop(k),
                inner.keys.switch(k),
                inner.keys.error(k),
                inner.keys.bytes(k),
            ])
            .await?;

        let info = SharedStreamInfo {
            content: source.content().clone(),
            title: source.title.clone(),
            format: source.format,
            primary_url: source.url().to_string(),
            current_url: source.url().to_string(),
            owner: inner.node_id.clone(),
            pid: None,
            created_at: Utc::now(),
            health: HealthStatus::Healthy,
            bandwidth_bps: 0,
            restarts: 0,
            hls_channel: hls_channel.clone(),
        };
        inner.write_info(key, &info).await?;
        inner
            .store
            .set(&inner.keys.last_activity(k), &Utc::now().to_rfc3339(), None)
            .await?;
        inner.set_status(key, StreamStatus::Starting).await?;
        inner.store.sadd(&inner.keys.active_streams(), k).await?;

        let cancel = CancellationToken::new();
        let process = Arc::new(ProcessState::new());
        let (ready_tx, ready_rx) = oneshot::channel();

        let local = Arc::new(LocalStream {
            key: key.clone(),
            format: source.format,
            hls_channel: hls_channel.clone(),
            cancel: cancel.clone(),
            process: Arc::clone(&process),
            task: Mutex::new(None),
        });
        inner.local.insert(k.to_string(), Arc::clone(&local));

        let driver = StreamDriver {
            ctx: Arc::clone(inner),
            key: key.clone(),
            source: source.clone(),
            template,
            hls_channel,
            cancel,
            process,
            info,
            ready: Some(ready_tx),
        };

        log::info!(
            stream_key = %key,
            title = %source.title,
            source_url = %source.url(),
            format = %source.format,
            "Creating shared stream"
        );
        let span = log::info_span!("stream_driver", stream_key = %key);
        *local.task.lock() = Some(tokio::spawn(driver.run().instrument(span)));

        match tokio::time::timeout(inner.streaming.lock_ttl(), ready_rx).await {
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Ok(Ok(()))) | Ok(Err(_)) | Err(_) => {}
        }

        self.status(key)
            .await?
            .ok_or_else(|| StreamError::StreamNotFound(key.to_string()))
    }

    /// Detach a client. At zero clients, teardown is scheduled after the
    /// grace period so quick reconnects reuse the running stream.
    pub async fn release(&self, key: &StreamKey, client_id: &str) -> StreamResult<()> {
        let remaining = self.inner.sessions.deregister(key, client_id).await?;
        if remaining == Some(0) {
            self.schedule_teardown(key.clone());
        }
        Ok(())
    }

    fn schedule_teardown(&self, key: StreamKey) {
        let registry = self.clone();
        // Past the grace window, so the idle check below sees it expired.
        let grace = self.inner.streaming.grace_period() + self.inner.streaming.poll_interval();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = registry.stop_if_idle(&key).await {
                log::warn!(stream_key = %key, error = %e, "Deferred teardown failed");
            }
        });
    }

    /// Stop `key` if it has no clients and has been idle for the grace
    /// period. Returns true if a stop was issued.
    pub async fn stop_if_idle(&self, key: &StreamKey) -> StreamResult<bool> {
        let inner = &self.inner;
        let Some(status) = inner.read_status(key).await? else {
            return Ok(false);
        };
        if !status.is_live() && status != StreamStatus::Error {
            return Ok(false);
        }
        if inner.sessions.client_count(key).await? > 0 {
            return Ok(false);
        }
        if let Some(last) = inner.sessions.last_activity(key).await? {
            let idle = (Utc::now() - last).to_std().unwrap_or_default();
            if idle < inner.streaming.grace_period() {
                return Ok(false);
            }
        }

        // Mark first, then re-check: a client may have attached in between.
        inner.set_status(key, StreamStatus::Stopping).await?;
        if inner.sessions.client_count(key).await? > 0 {
            log::debug!(stream_key = %key, "Teardown aborted, late client attached");
            inner.set_status(key, status).await?;
            return Ok(false);
        }

        log::info!(stream_key = %key, "Stopping idle stream");
        self.stop(key).await
    }

    /// Stop a stream. The owner's driver terminates the process; if this
    /// node is the owner, wait for that to finish.
    pub async fn stop(&self, key: &StreamKey) -> StreamResult<bool> {
        let inner = &self.inner;
        let status = inner.read_status(key).await?;
        let local = inner.local.get(key.as_str()).map(|e| Arc::clone(e.value()));

        if local.is_none() && status.is_none_or(StreamStatus::is_terminal) {
            return Ok(false);
        }

        if status != Some(StreamStatus::Stopping) {
            inner.set_status(key, StreamStatus::Stopping).await?;
        }
        inner
            .store
            .set(
                &inner.keys.stop(key.as_str()),
                &inner.node_id,
                Some(inner.streaming.stop_timeout() * 3),
            )
            .await?;

        if let Some(local) = local {
            local.cancel.cancel();
            let task = local.task.lock().take();
            if let Some(task) = task {
                let wait = inner.streaming.stop_timeout() * 2 + Duration::from_secs(1);
                if tokio::time::timeout(wait, task).await.is_err() {
                    log::error!(stream_key = %key, "Stream driver did not finish in time");
                }
            }
        }
        Ok(true)
    }

    /// Ask the owner to abandon the current source (explicit health-check
    /// failure).
    pub async fn request_failover(&self, key: &StreamKey, reason: &str) -> StreamResult<()> {
        match self.inner.read_status(key).await? {
            Some(status) if status.is_live() => self.inner.failover.request_switch(key, reason).await,
            Some(status) => Err(StreamError::InvalidState(format!(
                "stream {key} is {status}, cannot fail over"
            ))),
            None => Err(StreamError::StreamNotFound(key.to_string())),
        }
    }

    /// Assemble the full stream record, `None` if the stream is unknown.
    pub async fn status(&self, key: &StreamKey) -> StreamResult<Option<SharedStream>> {
        let inner = &self.inner;
        let k = key.as_str();
        let Some(status) = inner.read_status(key).await? else {
            return Ok(None);
        };

        let info = match inner.store.get(&inner.keys.info(k)).await? {
            Some(json) => serde_json::from_str::<SharedStreamInfo>(&json).ok(),
            None => None,
        };
        let failover_phase: Option<FailoverPhase> =
            inner.failover.load(key).await.ok().flatten().map(|s| s.phase);

        Ok(Some(SharedStream {
            key: key.clone(),
            status,
            info,
            client_count: inner.sessions.client_count(key).await?,
            bytes_transferred: u64::try_from(inner.store.get_i64(&inner.keys.bytes(k)).await?)
                .unwrap_or(0),
            last_activity_at: inner.sessions.last_activity(key).await?,
            error: inner.store.get(&inner.keys.error(k)).await?,
            failover_phase,
        }))
    }

    /// Every stream in the active set that still has a status.
    pub async fn list_active(&self) -> StreamResult<Vec<SharedStream>> {
        let members = self.inner.store.smembers(&self.inner.keys.active_streams()).await?;
        let mut streams = Vec::with_capacity(members.len());
        for member in members {
            let Some(key) = StreamKey::parse(&member) else {
                continue;
            };
            if let Some(stream) = self.status(&key).await? {
                streams.push(stream);
            }
        }
        Ok(streams)
    }

    /// Stream keys in the active set, including ones whose status expired.
    pub async fn active_keys(&self) -> StreamResult<Vec<StreamKey>> {
        let members = self.inner.store.smembers(&self.inner.keys.active_streams()).await?;
        Ok(members.iter().filter_map(|m| StreamKey::parse(m)).collect())
    }

    /// Forget a stream whose owner vanished without cleaning up.
    pub async fn purge(&self, key: &StreamKey) -> StreamResult<()> {
        let inner = &self.inner;
        if inner.local.contains_key(key.as_str()) {
            return Err(StreamError::InvalidState(format!(
                "stream {key} is owned by this node"
            )));
        }
        inner.store.delete(&inner.keys.stream_state(key.as_str())).await?;
        inner
            .store
            .srem(&inner.keys.active_streams(), key.as_str())
            .await?;
        log::info!(stream_key = %key, "Purged orphaned stream state");
        Ok(())
    }

    pub async fn touch_hls(&self, channel: &str) -> StreamResult<()> {
        self.inner.touch_hls(channel).await
    }

    pub async fn hls_last_seen(&self, channel: &str) -> StreamResult<Option<DateTime<Utc>>> {
        let raw = self.inner.store.get(&self.inner.keys.hls_last_seen(channel)).await?;
        Ok(raw
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    #[must_use]
    pub fn local_stream(&self, key: &StreamKey) -> Option<Arc<LocalStream>> {
        self.inner.local.get(key.as_str()).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn process_snapshot(&self, key: &StreamKey) -> Option<ProcessSnapshot> {
        self.local_stream(key).map(|local| local.process())
    }

    /// HLS directories in use by processes on this node.
    #[must_use]
    pub fn local_hls_channels(&self) -> Vec<String> {
        self.inner
            .local
            .iter()
            .filter_map(|e| e.value().hls_channel.clone())
            .collect()
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        self.inner.local.len()
    }

    /// Stop every stream owned by this node.
    pub async fn shutdown(&self) {
        let keys: Vec<StreamKey> = self.inner.local.iter().map(|e| e.value().key.clone()).collect();
        log::info!(count = keys.len(), "Stopping local streams");
        for key in keys {
            if let Err(e) = self.stop(&key).await {
                log::warn!(stream_key = %key, error = %e, "Failed to stop stream during shutdown");
            }
        }
    }
}
