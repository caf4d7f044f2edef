// Shared buffer store
//
// Transport-stream output lives in the state store as an append-only chunk
// log per stream key, so any worker on any node can read it:
// - stream:{key}:index      highest committed sequence number
// - stream:{key}:chunk:{n}  payload of chunk n (n starts at 1)
//
// There is exactly one writer per key (the node that owns the process). It
// writes the chunk before publishing the new index, so a reader that sees
// index n can always fetch chunks up to n.
//
// HLS output is a directory of segment files instead, see `hls`.

pub mod hls;

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing as log;
use tvrelay_core::config::StreamingConfig;
use tvrelay_core::store::{Keys, StateStore};

use crate::error::StreamResult;
use crate::key::StreamKey;

pub use self::hls::HlsDirectory;

/// Read side of a stream's chunk log.
#[derive(Clone)]
pub struct ChunkBuffer {
    store: Arc<dyn StateStore>,
    keys: Keys,
    stream_key: StreamKey,
    max_read_chunks: usize,
}

impl ChunkBuffer {
    pub fn new(
        store: Arc<dyn StateStore>,
        keys: Keys,
        stream_key: StreamKey,
        config: &StreamingConfig,
    ) -> Self {
        Self {
            store,
            keys,
            stream_key,
            max_read_chunks: config.max_read_chunks.max(1),
        }
    }

    #[must_use]
    pub fn stream_key(&self) -> &StreamKey {
        &self.stream_key
    }

    /// Highest committed sequence number, 0 if nothing was written yet.
    ///
    /// A client joining now starts its cursor here, so it only sees data
    /// produced after it joined.
    pub async fn head(&self) -> StreamResult<u64> {
        let head = self
            .store
            .get_i64(&self.keys.buffer_index(self.stream_key.as_str()))
            .await?;
        Ok(u64::try_from(head).unwrap_or(0))
    }

    /// Return every committed chunk strictly newer than `cursor` (up to the
    /// batch limit) concatenated, with the new cursor. `None` means there is
    /// nothing new yet; the caller backs off and polls again.
    pub async fn read(&self, cursor: u64) -> StreamResult<Option<(Bytes, u64)>> {
        let head = self.head().await?;
        if head <= cursor {
            return Ok(None);
        }

        let end = head.min(cursor + self.max_read_chunks as u64);
        let keys: Vec<String> = (cursor + 1..=end)
            .map(|seq| self.keys.chunk(self.stream_key.as_str(), seq))
            .collect();
        let chunks = self.store.get_bytes_many(&keys).await?;

        let mut out = BytesMut::new();
        let mut new_cursor = cursor;
        for (seq, chunk) in (cursor + 1..=end).zip(chunks) {
            match chunk {
                Some(data) => {
                    out.extend_from_slice(&data);
                    new_cursor = seq;
                }
                None if out.is_empty() => {
                    // Pruned or expired under a reader that fell too far
                    // behind. Skip the hole rather than stall forever.
                    log::warn!(
                        stream_key = %self.stream_key,
                        seq,
                        "Chunk missing from buffer, skipping"
                    );
                    new_cursor = seq;
                }
                None => break,
            }
        }

        if new_cursor == cursor {
            return Ok(None);
        }
        Ok(Some((out.freeze(), new_cursor)))
    }
}

/// Write side of a stream's chunk log. Owned by the stream driver.
pub struct BufferWriter {
    store: Arc<dyn StateStore>,
    keys: Keys,
    stream_key: StreamKey,
    next_seq: u64,
    retained: VecDeque<(u64, Instant)>,
    retention: Duration,
    orphan_ttl: Duration,
}

impl BufferWriter {
    /// Open the writer, continuing the sequence of any earlier run under the
    /// same key so cursors never go backwards.
    pub async fn open(
        store: Arc<dyn StateStore>,
        keys: Keys,
        stream_key: StreamKey,
        config: &StreamingConfig,
    ) -> StreamResult<Self> {
        let head = store.get_i64(&keys.buffer_index(stream_key.as_str())).await?;
        Ok(Self {
            store,
            keys,
            stream_key,
            next_seq: u64::try_from(head).unwrap_or(0) + 1,
            retained: VecDeque::new(),
            retention: Duration::from_secs(config.buffer_ttl_seconds),
            orphan_ttl: Duration::from_secs(config.orphan_ttl_seconds),
        })
    }

    /// Append one chunk and return its sequence number.
    pub async fn append(&mut self, data: Bytes) -> StreamResult<u64> {
        let seq = self.next_seq;
        let key = self.stream_key.as_str();

        // The orphan TTL only matters if this node dies before pruning.
        self.store
            .set_bytes(&self.keys.chunk(key, seq), data, Some(self.orphan_ttl))
            .await?;
        self.store
            .set(
                &self.keys.buffer_index(key),
                &seq.to_string(),
                Some(self.orphan_ttl),
            )
            .await?;

        self.next_seq += 1;
        self.retained.push_back((seq, Instant::now()));
        Ok(seq)
    }

    #[must_use]
    pub const fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    #[must_use]
    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    /// Drop chunks every attached reader has already consumed and that are
    /// older than the retention window. `min_cursor` is the lowest session
    /// cursor, `None` when no session is attached.
    pub async fn prune(&mut self, min_cursor: Option<u64>) -> StreamResult<usize> {
        let mut expired = Vec::new();
        while let Some(&(seq, written_at)) = self.retained.front() {
            let consumed = min_cursor.is_none_or(|cursor| seq <= cursor);
            if !consumed || written_at.elapsed() < self.retention {
                break;
            }
            expired.push(self.keys.chunk(self.stream_key.as_str(), seq));
            self.retained.pop_front();
        }

        let count = expired.len();
        if count > 0 {
            self.store.delete(&expired).await?;
            log::trace!(stream_key = %self.stream_key, count, "Pruned buffer chunks");
        }
        Ok(count)
    }

    /// Release the buffer once the process has stopped. With readers still
    /// attached the chunks get the retention window to drain; otherwise
    /// they are deleted right away.
    pub async fn release(&mut self, readers_attached: bool) -> StreamResult<()> {
        let keys: Vec<String> = self
            .retained
            .drain(..)
            .map(|(seq, _)| self.keys.chunk(self.stream_key.as_str(), seq))
            .collect();

        if readers_attached {
            for key in &keys {
                self.store.expire(key, self.retention).await?;
            }
            self.store
                .expire(&self.keys.buffer_index(self.stream_key.as_str()), self.retention)
                .await?;
        } else {
            self.store.delete(&keys).await?;
        }
        Ok(())
    }
}
