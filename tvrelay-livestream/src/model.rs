// Records shared through the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tvrelay_core::source::{ContentRef, OutputFormat};

use crate::failover::FailoverPhase;
use crate::key::StreamKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Starting,
    Active,
    Stopping,
    Stopped,
    Error,
}

impl StreamStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// A process exists (or is about to) and new clients may attach.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "active" => Ok(Self::Active),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown stream status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Respawning or switching sources.
    Degraded,
    Failing,
}

/// Owner-written description of a shared stream. Only the node running the
/// process writes this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStreamInfo {
    pub content: ContentRef,
    pub title: String,
    pub format: OutputFormat,
    pub primary_url: String,
    pub current_url: String,
    pub owner: String,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub bandwidth_bps: u64,
    #[serde(default)]
    pub restarts: u32,
    /// HLS output directory name, for HLS streams.
    #[serde(default)]
    pub hls_channel: Option<String>,
}

/// Full view of a shared stream, assembled from the individual state keys.
#[derive(Debug, Clone, Serialize)]
pub struct SharedStream {
    pub key: StreamKey,
    pub status: StreamStatus,
    #[serde(flatten)]
    pub info: Option<SharedStreamInfo>,
    pub client_count: i64,
    pub bytes_transferred: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failover_phase: Option<FailoverPhase>,
}

impl SharedStream {
    #[must_use]
    pub fn uptime_seconds(&self) -> i64 {
        self.info
            .as_ref()
            .map_or(0, |info| (Utc::now() - info.created_at).num_seconds().max(0))
    }
}

/// Row returned by the active-streams listing.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub client_count: i64,
    pub uptime: i64,
    pub status: StreamStatus,
}

impl From<&SharedStream> for StreamSummary {
    fn from(stream: &SharedStream) -> Self {
        Self {
            key: stream.key.to_string(),
            kind: stream
                .info
                .as_ref()
                .map(|i| i.content.kind.as_str().to_string())
                .or_else(|| stream.key.content().map(|c| c.kind.as_str().to_string()))
                .unwrap_or_default(),
            title: stream
                .info
                .as_ref()
                .map(|i| i.title.clone())
                .unwrap_or_default(),
            client_count: stream.client_count,
            uptime: stream.uptime_seconds(),
            status: stream.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

/// Who is asking. Captured from the HTTP request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSession {
    pub stream_key: StreamKey,
    pub client_id: String,
    pub ip: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub cursor: u64,
    pub status: SessionStatus,
}
