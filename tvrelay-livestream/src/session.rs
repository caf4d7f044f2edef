// Client session tracker
//
// Sessions live in the hash stream:{key}:sessions (client id -> JSON), and
// stream:{key}:clients is the attachment counter. Each session field is
// written only by the worker serving that client, except for eviction.
// The counter is only decremented when HDEL actually removed the field, so
// disconnect and eviction racing each other cannot double-decrement.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing as log;
use tvrelay_core::store::{Keys, StateStore};

use crate::error::StreamResult;
use crate::failover::FailoverResolver;
use crate::key::StreamKey;
use crate::model::{ClientInfo, ClientSession, SessionStatus};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub client_count: i64,
    pub total_bytes_received: u64,
    pub sessions: Vec<ClientSession>,
}

#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn StateStore>,
    keys: Keys,
    failover: FailoverResolver,
    inactivity: Duration,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn StateStore>,
        keys: Keys,
        failover: FailoverResolver,
        inactivity: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            failover,
            inactivity,
        }
    }

    /// Attach a new client. `cursor` is the buffer position it starts from.
    pub async fn register(
        &self,
        key: &StreamKey,
        client: &ClientInfo,
        cursor: u64,
    ) -> StreamResult<ClientSession> {
        let now = Utc::now();
        let session = ClientSession {
            stream_key: key.clone(),
            client_id: nanoid::nanoid!(16),
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            connected_at: now,
            last_activity_at: now,
            bytes_received: 0,
            cursor,
            status: SessionStatus::Connected,
        };

        let json = serde_json::to_string(&session)?;
        self.store
            .hset(&self.keys.sessions(key.as_str()), &session.client_id, &json)
            .await?;
        let count = self.store.incr_by(&self.keys.clients(key.as_str()), 1).await?;
        self.touch_stream(key).await?;

        log::info!(
            stream_key = %key,
            client_id = %session.client_id,
            ip = %session.ip,
            client_count = count,
            "Client attached"
        );
        Ok(session)
    }

    /// Record a successful pull. Returns false if the session is gone
    /// (evicted), in which case the worker should stop serving.
    ///
    /// The write only lands if the field still exists, so an eviction that
    /// already decremented the counter is never undone by a late update.
    pub async fn record_activity(&self, session: &mut ClientSession) -> StreamResult<bool> {
        session.last_activity_at = Utc::now();
        let json = serde_json::to_string(&*session)?;
        let written = self
            .store
            .hset_if_exists(
                &self.keys.sessions(session.stream_key.as_str()),
                &session.client_id,
                &json,
            )
            .await?;
        Ok(written)
    }

    /// Detach a client. Returns the remaining client count, or `None` if the
    /// session had already been removed.
    pub async fn deregister(&self, key: &StreamKey, client_id: &str) -> StreamResult<Option<i64>> {
        let removed = self
            .store
            .hdel(&self.keys.sessions(key.as_str()), client_id)
            .await?;
        if !removed {
            return Ok(None);
        }

        let count = self.store.incr_by(&self.keys.clients(key.as_str()), -1).await?;
        self.touch_stream(key).await?;
        log::info!(stream_key = %key, client_id, client_count = count, "Client detached");
        Ok(Some(count.max(0)))
    }

    pub async fn list_sessions(&self, key: &StreamKey) -> StreamResult<Vec<ClientSession>> {
        let entries = self.store.hgetall(&self.keys.sessions(key.as_str())).await?;
        let mut sessions: Vec<ClientSession> = entries
            .into_iter()
            .filter_map(|(client_id, json)| match serde_json::from_str(&json) {
                Ok(session) => Some(session),
                Err(e) => {
                    log::warn!(stream_key = %key, client_id, error = %e, "Dropping unreadable session");
                    None
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        Ok(sessions)
    }

    pub async fn client_count(&self, key: &StreamKey) -> StreamResult<i64> {
        Ok(self
            .store
            .get_i64(&self.keys.clients(key.as_str()))
            .await?
            .max(0))
    }

    pub async fn stats(&self, key: &StreamKey) -> StreamResult<SessionStats> {
        let sessions = self.list_sessions(key).await?;
        Ok(SessionStats {
            client_count: self.client_count(key).await?,
            total_bytes_received: sessions.iter().map(|s| s.bytes_received).sum(),
            sessions,
        })
    }

    /// Lowest cursor among attached sessions; `None` if nobody is attached.
    pub async fn min_cursor(&self, key: &StreamKey) -> StreamResult<Option<u64>> {
        Ok(self
            .list_sessions(key)
            .await?
            .iter()
            .map(|s| s.cursor)
            .min())
    }

    /// Remove sessions with no activity inside the inactivity window.
    /// Returns the evicted client ids.
    pub async fn evict_inactive(&self, key: &StreamKey) -> StreamResult<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inactivity).unwrap_or(chrono::Duration::seconds(60));
        let mut evicted = Vec::new();

        for session in self.list_sessions(key).await? {
            if session.last_activity_at >= cutoff {
                continue;
            }
            if self.deregister(key, &session.client_id).await?.is_some() {
                log::info!(
                    stream_key = %key,
                    client_id = %session.client_id,
                    idle_seconds = (Utc::now() - session.last_activity_at).num_seconds(),
                    "Evicted inactive client"
                );
                evicted.push(session.client_id);
            }
        }
        Ok(evicted)
    }

    /// Whether the stream is mid-swap, so adapters can stretch their read
    /// timeouts instead of dropping the client.
    pub async fn is_failover_in_progress(&self, key: &StreamKey) -> StreamResult<bool> {
        self.failover.is_in_progress(key).await
    }

    pub async fn last_activity(&self, key: &StreamKey) -> StreamResult<Option<DateTime<Utc>>> {
        let raw = self.store.get(&self.keys.last_activity(key.as_str())).await?;
        Ok(raw
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn touch_stream(&self, key: &StreamKey) -> StreamResult<()> {
        self.store
            .set(
                &self.keys.last_activity(key.as_str()),
                &Utc::now().to_rfc3339(),
                None,
            )
            .await?;
        Ok(())
    }
}
