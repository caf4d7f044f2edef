// Failover resolver
//
// Per-stream state machine, stored as one JSON record under
// stream:{key}:failover and written only by the stream's owner:
//
//   PrimaryActive --failure--> Switching --data--> CandidateActive
//         ^                        |                     |
//         |                        | no candidate left   | failure
//         +-- (never goes back)    v                     v
//                              Exhausted <---------- Switching
//
// `current_index` only ever moves forward. The stream key and buffer stay
// the same across a swap, so attached clients never reconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing as log;
use tvrelay_core::source::CandidateSource;
use tvrelay_core::store::{Keys, StateStore};

use crate::error::StreamResult;
use crate::key::StreamKey;
use crate::supervisor::SourceTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    PrimaryActive,
    Switching,
    CandidateActive,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverSource {
    pub url: String,
    pub user_agent: String,
    pub priority: i32,
    pub auto_matched: bool,
    pub match_quality: f32,
}

impl FailoverSource {
    #[must_use]
    pub fn target(&self) -> SourceTarget {
        SourceTarget {
            url: self.url.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

impl From<CandidateSource> for FailoverSource {
    fn from(c: CandidateSource) -> Self {
        Self {
            url: c.url,
            user_agent: c.user_agent,
            priority: c.priority,
            auto_matched: c.auto_matched,
            match_quality: c.match_quality,
        }
    }
}

/// Failover record for one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverState {
    pub phase: FailoverPhase,
    /// Index 0 is the primary source, followed by the ordered candidates.
    pub sources: Vec<FailoverSource>,
    /// Last-known-good source, or the one being tried while switching.
    pub current_index: usize,
    pub switch_count: u32,
    pub last_failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FailoverState {
    #[must_use]
    pub fn current(&self) -> Option<&FailoverSource> {
        self.sources.get(self.current_index)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.sources.len().saturating_sub(self.current_index + 1)
    }

    #[must_use]
    pub fn attempted_urls(&self) -> Vec<&str> {
        self.sources
            .iter()
            .take(self.current_index + 1)
            .map(|s| s.url.as_str())
            .collect()
    }
}

/// Order candidates for trying: lower `priority` first; within one
/// priority, manually configured sources before auto-matched ones, and
/// auto-matched ones by descending match quality.
#[must_use]
pub fn order_candidates(mut candidates: Vec<CandidateSource>) -> Vec<CandidateSource> {
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.auto_matched.cmp(&b.auto_matched))
            .then_with(|| {
                if a.auto_matched && b.auto_matched {
                    b.match_quality
                        .partial_cmp(&a.match_quality)
                        .unwrap_or(Ordering::Equal)
                } else {
                    Ordering::Equal
                }
            })
    });
    candidates
}

#[derive(Clone)]
pub struct FailoverResolver {
    store: Arc<dyn StateStore>,
    keys: Keys,
}

impl FailoverResolver {
    pub fn new(store: Arc<dyn StateStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    /// Write the initial PrimaryActive record for a new stream.
    pub async fn init(
        &self,
        key: &StreamKey,
        primary: SourceTarget,
        candidates: Vec<CandidateSource>,
    ) -> StreamResult<FailoverState> {
        let mut sources = vec![FailoverSource {
            url: primary.url,
            user_agent: primary.user_agent,
            priority: i32::MIN,
            auto_matched: false,
            match_quality: 1.0,
        }];
        sources.extend(order_candidates(candidates).into_iter().map(FailoverSource::from));

        let state = FailoverState {
            phase: FailoverPhase::PrimaryActive,
            sources,
            current_index: 0,
            switch_count: 0,
            last_failure: None,
            updated_at: Utc::now(),
        };
        self.save(key, &state).await?;
        Ok(state)
    }

    pub async fn load(&self, key: &StreamKey) -> StreamResult<Option<FailoverState>> {
        let raw = self.store.get(&self.keys.failover(key.as_str())).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &StreamKey, state: &FailoverState) -> StreamResult<()> {
        let json = serde_json::to_string(state)?;
        self.store
            .set(&self.keys.failover(key.as_str()), &json, None)
            .await?;
        Ok(())
    }

    /// The active source failed. Move to the next untried source and return
    /// it, or mark the stream Exhausted and return `None`.
    pub async fn begin_switch(
        &self,
        key: &StreamKey,
        state: &mut FailoverState,
        failure: &str,
    ) -> StreamResult<Option<SourceTarget>> {
        state.last_failure = Some(failure.to_string());
        state.updated_at = Utc::now();

        if state.remaining() == 0 {
            state.phase = FailoverPhase::Exhausted;
            self.save(key, state).await?;
            log::error!(
                stream_key = %key,
                attempted = ?state.attempted_urls(),
                failure,
                "All failover sources exhausted"
            );
            return Ok(None);
        }

        let failed_url = state.current().map(|s| s.url.clone()).unwrap_or_default();
        state.current_index += 1;
        state.phase = FailoverPhase::Switching;
        self.save(key, state).await?;

        let next = state.current().map(FailoverSource::target);
        log::warn!(
            stream_key = %key,
            failed_source = %failed_url,
            next_source = ?next.as_ref().map(|t| t.url.as_str()),
            remaining = state.remaining(),
            failure,
            "Switching to failover source"
        );
        Ok(next)
    }

    /// The source being switched to produced data. Logs exactly one
    /// retarget event per successful switch.
    pub async fn confirm_active(&self, key: &StreamKey, state: &mut FailoverState) -> StreamResult<()> {
        if state.phase != FailoverPhase::Switching {
            return Ok(());
        }
        state.phase = if state.current_index == 0 {
            FailoverPhase::PrimaryActive
        } else {
            FailoverPhase::CandidateActive
        };
        state.switch_count += 1;
        state.updated_at = Utc::now();
        self.save(key, state).await?;

        log::info!(
            stream_key = %key,
            source_url = %state.current().map(|s| s.url.as_str()).unwrap_or_default(),
            source_index = state.current_index,
            switch_count = state.switch_count,
            "Process retargeted to failover source"
        );
        Ok(())
    }

    pub async fn is_in_progress(&self, key: &StreamKey) -> StreamResult<bool> {
        Ok(self
            .load(key)
            .await?
            .is_some_and(|s| s.phase == FailoverPhase::Switching))
    }

    /// Ask the owner of `key` to abandon its current source, as if a health
    /// check had failed. Picked up on the owner's next control tick.
    pub async fn request_switch(&self, key: &StreamKey, reason: &str) -> StreamResult<()> {
        self.store
            .set(&self.keys.switch(key.as_str()), reason, None)
            .await?;
        Ok(())
    }
}
