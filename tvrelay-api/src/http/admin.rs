//! Admin HTTP endpoints
//!
//! Inspection and control of shared streams, plus a probe for candidate
//! source URLs.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing as log;
use tvrelay_livestream::supervisor::ProcessSnapshot;
use tvrelay_livestream::{
    ClientSession, FailoverState, SessionStats, SharedStream, StreamKey, StreamSummary,
};

use crate::http::{AppError, AppResult, AppState};

/// Upper bound on how long a source probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Stop reading once this much has been sampled.
const PROBE_SAMPLE_BYTES: u64 = 64 * 1024;

pub fn create_admin_router() -> Router<AppState> {
    Router::new()
        .route("/admin/streams", get(list_streams))
        .route("/admin/streams/{key}", get(get_stream).delete(stop_stream))
        .route("/admin/streams/{key}/sessions", get(list_sessions))
        .route("/admin/streams/{key}/failover", post(request_failover))
        .route("/admin/test-source", post(test_source))
}

fn parse_key(raw: &str) -> AppResult<StreamKey> {
    StreamKey::parse(raw).ok_or_else(|| AppError::bad_request(format!("Invalid stream key: {raw}")))
}

/// List active streams
pub async fn list_streams(State(state): State<AppState>) -> AppResult<Json<Vec<StreamSummary>>> {
    let streams = state.streaming.registry.list_active().await?;
    Ok(Json(streams.iter().map(StreamSummary::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct StreamDetail {
    #[serde(flatten)]
    pub stream: SharedStream,
    /// Present only on the owning node
    pub process: Option<ProcessSnapshot>,
    pub failover: Option<FailoverState>,
    pub sessions: Vec<ClientSession>,
}

/// Full record for one stream
pub async fn get_stream(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Json<StreamDetail>> {
    let key = parse_key(&key)?;
    let registry = &state.streaming.registry;

    let stream = registry
        .status(&key)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Stream not found: {key}")))?;
    let failover = registry.failover().load(&key).await?;
    let sessions = registry.sessions().list_sessions(&key).await?;

    Ok(Json(StreamDetail {
        stream,
        process: registry.process_snapshot(&key),
        failover,
        sessions,
    }))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub key: String,
    pub stopped: bool,
}

/// Stop a stream regardless of attached viewers
pub async fn stop_stream(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Json<StopResponse>> {
    let key = parse_key(&key)?;
    if !state.streaming.registry.stop(&key).await? {
        return Err(AppError::not_found(format!("Stream not running: {key}")));
    }
    log::info!(stream_key = %key, "Stream stopped via admin API");

    Ok(Json(StopResponse {
        key: key.to_string(),
        stopped: true,
    }))
}

/// Attached viewers and their totals
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Json<SessionStats>> {
    let key = parse_key(&key)?;
    Ok(Json(state.streaming.registry.sessions().stats(&key).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct FailoverRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct FailoverResponse {
    pub key: String,
    pub requested: bool,
}

/// Signal a failed health check; the owner moves to the next source
pub async fn request_failover(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<FailoverRequest>,
) -> AppResult<(StatusCode, Json<FailoverResponse>)> {
    let key = parse_key(&key)?;
    let reason = if req.reason.is_empty() {
        "requested via admin API"
    } else {
        req.reason.as_str()
    };
    state.streaming.registry.request_failover(&key, reason).await?;
    log::info!(stream_key = %key, reason, "Failover requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(FailoverResponse {
            key: key.to_string(),
            requested: true,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct TestSourceRequest {
    pub url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct TestSourceResponse {
    pub url: String,
    pub reachable: bool,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub first_byte_ms: Option<u64>,
    pub bytes_sampled: u64,
    pub error: Option<String>,
}

/// Probe a source URL: status, content type, time to first byte
pub async fn test_source(
    State(state): State<AppState>,
    Json(req): Json<TestSourceRequest>,
) -> AppResult<Json<TestSourceResponse>> {
    if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
        return Err(AppError::bad_request("url must be http or https"));
    }
    let user_agent = req.user_agent.unwrap_or_else(|| {
        state
            .streaming
            .registry
            .streaming_config()
            .default_user_agent
            .clone()
    });

    let mut result = TestSourceResponse {
        url: req.url.clone(),
        ..TestSourceResponse::default()
    };
    let started = Instant::now();
    let deadline = started + PROBE_TIMEOUT;

    let response = match tokio::time::timeout(
        PROBE_TIMEOUT,
        state
            .http_client
            .get(&req.url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send(),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            result.error = Some(e.to_string());
            return Ok(Json(result));
        }
        Err(_) => {
            result.error = Some("timed out waiting for response".to_string());
            return Ok(Json(result));
        }
    };

    result.status = Some(response.status().as_u16());
    result.reachable = response.status().is_success();
    result.content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = response;
    while result.bytes_sampled < PROBE_SAMPLE_BYTES {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                if result.first_byte_ms.is_none() {
                    result.first_byte_ms = Some(started.elapsed().as_millis() as u64);
                }
                result.bytes_sampled += chunk.len() as u64;
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                result.error = Some(e.to_string());
                break;
            }
            Err(_) => {
                if result.first_byte_ms.is_none() {
                    result.error = Some("no data before timeout".to_string());
                }
                break;
            }
        }
    }

    log::debug!(url = %result.url, status = ?result.status, bytes = result.bytes_sampled, "Source probed");
    Ok(Json(result))
}
