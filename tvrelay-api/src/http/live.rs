//! Viewer endpoints
//!
//! `GET /live/{id}` and `GET /vod/{id}` serve a shared TS feed, or redirect
//! to the HLS manifest when the content is delivered as HLS.
//! `GET /{live|vod}/{id}/hls/{file}` serves the manifest and its segments.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tracing as log;
use tvrelay_core::source::{ContentRef, OutputFormat};
use tvrelay_livestream::buffer::hls::MANIFEST_NAME;
use tvrelay_livestream::delivery::hls::{MANIFEST_CONTENT_TYPE, SEGMENT_CONTENT_TYPE};
use tvrelay_livestream::ClientInfo;

use crate::http::{AppError, AppResult, AppState};

pub fn create_live_router() -> Router<AppState> {
    Router::new()
        .route("/live/{id}", get(live_ts))
        .route("/vod/{id}", get(vod_ts))
        .route("/live/{id}/hls/{file}", get(live_hls))
        .route("/vod/{id}/hls/{file}", get(vod_hls))
}

async fn live_ts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> AppResult<Response> {
    let client = client_info(request.headers(), request.extensions());
    serve_ts(&state, ContentRef::live(id), client).await
}

async fn vod_ts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> AppResult<Response> {
    let client = client_info(request.headers(), request.extensions());
    serve_ts(&state, ContentRef::on_demand(id), client).await
}

async fn live_hls(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> AppResult<Response> {
    serve_hls(&state, ContentRef::live(id), &file).await
}

async fn vod_hls(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> AppResult<Response> {
    serve_hls(&state, ContentRef::on_demand(id), &file).await
}

async fn serve_ts(state: &AppState, content: ContentRef, client: ClientInfo) -> AppResult<Response> {
    let (_, resolved) = state.streaming.registry.resolve(&content).await?;
    if resolved.format == OutputFormat::Hls {
        let location = format!("/{}/{}/hls/{MANIFEST_NAME}", content.kind, content.id);
        return Ok(Redirect::temporary(&location).into_response());
    }

    let stream = state.streaming.ts.open(&content, &client).await?;
    log::info!(
        stream_key = %stream.key,
        client_id = %stream.client_id,
        ip = %client.ip,
        "Viewer attached to TS stream"
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream.into_stream()))
        .map_err(|_| AppError::internal_server_error("Failed to build response"))
}

async fn serve_hls(state: &AppState, content: ContentRef, file: &str) -> AppResult<Response> {
    if file == MANIFEST_NAME {
        let manifest = state.streaming.hls.manifest(&content).await?;
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
            .header(header::CACHE_CONTROL, "no-cache, no-store")
            .body(Body::from(manifest.body))
            .map_err(|_| AppError::internal_server_error("Failed to build response"));
    }

    let segment = state.streaming.hls.segment(&content, file).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "max-age=60")
        .body(Body::from(segment))
        .map_err(|_| AppError::internal_server_error("Failed to build response"))
}

/// Viewer identity: the first forwarded address if behind a proxy, else the
/// peer address.
fn client_info(headers: &HeaderMap, extensions: &axum::http::Extensions) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let ip = forwarded
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    ClientInfo { ip, user_agent }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Extensions, HeaderValue};

    #[test]
    fn test_client_info_prefers_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("VLC/3.0"));
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));

        let client = client_info(&headers, &extensions);
        assert_eq!(client.ip, "203.0.113.7");
        assert_eq!(client.user_agent, "VLC/3.0");
    }

    #[test]
    fn test_client_info_falls_back_to_peer() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 5], 9000))));

        let client = client_info(&HeaderMap::new(), &extensions);
        assert_eq!(client.ip, "192.168.1.5");
        assert_eq!(client.user_agent, "");

        let client = client_info(&HeaderMap::new(), &Extensions::new());
        assert_eq!(client.ip, "unknown");
    }
}
