// Direct TS delivery
//
// Every viewer gets its own pump task reading the shared buffer from the
// session cursor and pushing into a bounded channel the HTTP body drains.
// Waiting for data is bounded polling, so a disconnect is noticed on the
// next iteration at the latest.
//
// Two read windows:
// - before the first byte: first_byte_timeout, stretched by the failover
//   extension while the stream is still starting or swapping sources
// - between chunks: gap_timeout, stretched while a swap is in progress. It
//   never ends before the supervisor could declare the source stalled, or
//   the viewer would be dropped before failover had a chance to run.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing as log;
use tvrelay_core::config::StreamingConfig;
use tvrelay_core::source::{ContentRef, OutputFormat};

use super::SessionGuard;
use crate::error::{StreamError, StreamResult};
use crate::key::StreamKey;
use crate::model::{ClientInfo, ClientSession, StreamStatus};
use crate::registry::StreamRegistry;

const CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct TsSettings {
    pub first_byte_timeout: Duration,
    pub gap_timeout: Duration,
    pub failover_extension: Duration,
    pub poll_interval: Duration,
}

impl From<&StreamingConfig> for TsSettings {
    fn from(config: &StreamingConfig) -> Self {
        let first_byte_timeout = Duration::from_secs(config.first_byte_timeout_seconds);
        let gap_timeout = Duration::from_secs(config.gap_timeout_seconds)
            .max(config.stall_timeout() + first_byte_timeout);
        Self {
            first_byte_timeout,
            gap_timeout,
            failover_extension: Duration::from_secs(config.failover_extension_seconds),
            poll_interval: config.poll_interval(),
        }
    }
}

/// A viewer's TS feed. The first chunk has already arrived by the time one
/// of these exists.
pub struct TsStream {
    pub key: StreamKey,
    pub client_id: String,
    first: Option<Bytes>,
    rx: mpsc::Receiver<StreamResult<Bytes>>,
}

impl TsStream {
    pub async fn next_chunk(&mut self) -> Option<StreamResult<Bytes>> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamResult<Bytes>> + Send + 'static {
        stream::iter(self.first.map(Ok)).chain(ReceiverStream::new(self.rx))
    }
}

#[derive(Clone)]
pub struct TsDelivery {
    registry: StreamRegistry,
    settings: TsSettings,
}

impl TsDelivery {
    pub fn new(registry: StreamRegistry) -> Self {
        let settings = TsSettings::from(registry.streaming_config());
        Self { registry, settings }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: TsSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach to the stream for `content` and wait for the first chunk.
    /// Fails instead of returning a stream that would never produce data.
    pub async fn open(&self, content: &ContentRef, client: &ClientInfo) -> StreamResult<TsStream> {
        let (key, resolved) = self.registry.resolve(content).await?;
        if resolved.format != OutputFormat::Ts {
            return Err(StreamError::InvalidState(format!(
                "{} {} is delivered as {}",
                content.kind, content.id, resolved.format
            )));
        }

        let attachment = self.registry.attach(&key, &resolved, client).await?;
        let client_id = attachment.session.client_id.clone();

        let guard = {
            let registry = self.registry.clone();
            let key = key.clone();
            let client_id = client_id.clone();
            SessionGuard::new(move || {
                tokio::spawn(async move {
                    if let Err(e) = registry.release(&key, &client_id).await {
                        log::warn!(stream_key = %key, client_id, error = %e, "Failed to release session");
                    }
                });
            })
        };

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = Pump {
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            session: attachment.session,
            tx,
        };
        tokio::spawn(async move {
            let _guard = guard;
            pump.run().await;
        });

        match rx.recv().await {
            Some(Ok(first)) => Ok(TsStream {
                key,
                client_id,
                first: Some(first),
                rx,
            }),
            Some(Err(e)) => Err(e),
            None => Err(StreamError::SourceUnreachable(format!(
                "stream {key} ended before producing data"
            ))),
        }
    }
}

struct Pump {
    registry: StreamRegistry,
    settings: TsSettings,
    session: ClientSession,
    tx: mpsc::Sender<StreamResult<Bytes>>,
}

enum PumpEnd {
    Finished,
    Disconnected,
    Evicted,
    Failed(StreamError),
}

impl Pump {
    async fn run(mut self) {
        let key = self.session.stream_key.clone();
        let end = match self.pump().await {
            Ok(end) => end,
            Err(e) => PumpEnd::Failed(e),
        };

        match end {
            PumpEnd::Finished => {
                log::debug!(stream_key = %key, client_id = %self.session.client_id, "Stream ended");
            }
            PumpEnd::Disconnected => {
                log::debug!(
                    stream_key = %key,
                    client_id = %self.session.client_id,
                    "{}",
                    StreamError::ClientDisconnected
                );
            }
            PumpEnd::Evicted => {
                log::info!(stream_key = %key, client_id = %self.session.client_id, "Session evicted, closing feed");
            }
            PumpEnd::Failed(e) => {
                log::warn!(
                    stream_key = %key,
                    client_id = %self.session.client_id,
                    bytes_received = self.session.bytes_received,
                    error = %e,
                    "Closing client feed with error"
                );
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn pump(&mut self) -> StreamResult<PumpEnd> {
        let key = self.session.stream_key.clone();
        let buffer = self.registry.buffer(&key);
        let mut delivered = false;
        let mut draining = false;
        let mut last_data = Instant::now();

        loop {
            if let Some((data, cursor)) = buffer.read(self.session.cursor).await? {
                let len = data.len() as u64;
                if self.tx.send(Ok(data)).await.is_err() {
                    return Ok(PumpEnd::Disconnected);
                }
                self.session.cursor = cursor;
                self.session.bytes_received += len;
                if !self.registry.sessions().record_activity(&mut self.session).await? {
                    return Ok(PumpEnd::Evicted);
                }
                delivered = true;
                last_data = Instant::now();
                continue;
            }

            if draining {
                return Ok(PumpEnd::Finished);
            }

            let status = self.registry.stream_status(&key).await?;
            match status {
                None | Some(StreamStatus::Stopping | StreamStatus::Stopped) => {
                    // One more read picks up anything written before the stop.
                    draining = true;
                    continue;
                }
                Some(StreamStatus::Error) => {
                    if let Some(e) = self.registry.terminal_error(&key).await? {
                        return Ok(PumpEnd::Failed(e));
                    }
                }
                Some(StreamStatus::Starting | StreamStatus::Active) => {}
            }

            let swapping = self.registry.sessions().is_failover_in_progress(&key).await?;
            let window = self.read_window(delivered, swapping, status);
            if last_data.elapsed() >= window {
                let reason = format!("no data for {window:?}");
                return Ok(PumpEnd::Failed(if delivered {
                    StreamError::StreamStalled(reason)
                } else {
                    StreamError::SourceUnreachable(reason)
                }));
            }

            tokio::select! {
                () = self.tx.closed() => return Ok(PumpEnd::Disconnected),
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    fn read_window(&self, delivered: bool, swapping: bool, status: Option<StreamStatus>) -> Duration {
        let s = &self.settings;
        if delivered {
            if swapping {
                s.gap_timeout + s.failover_extension
            } else {
                s.gap_timeout
            }
        } else if swapping || status == Some(StreamStatus::Starting) {
            s.first_byte_timeout + s.failover_extension
        } else {
            s.first_byte_timeout
        }
    }
}
