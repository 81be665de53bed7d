//! HTTP stream forwarder: HTTP-FLV, HLS playlists and segments, TS, audio.
//!
//! Media requests are recognized by extension (or by `app`/`stream` query
//! parameters), routed by their canonical stream URL, and reverse-proxied to
//! the backend's HTTP endpoint with a streaming body. Anything else falls
//! through to the optional static files directory.

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::backend::generate_context_id;
use crate::demux::unify_http_url;
use crate::error::{ProxyError, Result};
use crate::router::StreamRouter;
use crate::session::{HlsPlayStream, SessionTracker};

use super::status_for;

/// Extensions the proxy treats as live-stream traffic.
const MEDIA_EXTENSIONS: &[&str] = &[".flv", ".m3u8", ".ts", ".aac", ".mp3"];

#[derive(Clone)]
struct HttpState {
    router: StreamRouter,
    tracker: SessionTracker,
    client: reqwest::Client,
}

/// Run the HTTP stream server until cancelled.
pub async fn run_http_server(
    router: StreamRouter,
    tracker: SessionTracker,
    port: u16,
    static_dir: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = HttpState {
        router,
        tracker,
        client: reqwest::Client::new(),
    };

    let inner = match static_dir {
        Some(ref dir) if dir.exists() => {
            info!(dir = %dir.display(), "serving static files");
            Router::new().fallback_service(ServeDir::new(dir))
        }
        Some(ref dir) => {
            warn!(dir = %dir.display(), "static files directory missing, disabled");
            Router::new().fallback(not_found)
        }
        None => Router::new().fallback(not_found),
    };

    let app = inner
        .layer(middleware::from_fn_with_state(state, intercept_media))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ProxyError::io("bind http server", e))?;
    info!(port, "http stream server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ProxyError::io("serve http server", e))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Short-circuit media requests before the static fallback.
async fn intercept_media(State(state): State<HttpState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let host = host_of(req.headers());

    let app = query_param(&query, "app");
    let stream = query_param(&query, "stream");
    let unified = unify_http_url("http", &host, &path, app.as_deref(), stream.as_deref());

    let is_media = MEDIA_EXTENSIONS.contains(&unified.extension.as_str())
        || app.is_some()
        || stream.is_some();
    if !is_media {
        return next.run(req).await;
    }

    match forward_media(&state, &host, &path, &query, &unified.unified, &unified.full, &unified.extension).await {
        Ok(response) => response,
        Err(e) => {
            warn!(stream_url = %unified.unified, error = %e, "http forward failed");
            (status_for(&e), format!("{e}\n")).into_response()
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_media(
    state: &HttpState,
    host: &str,
    path: &str,
    query: &str,
    unified: &str,
    full: &str,
    extension: &str,
) -> Result<Response> {
    // Segment requests carry the session handle of their playlist so they
    // land on the same backend.
    let backend = if extension == ".ts" {
        match query_param(query, "spbhid") {
            Some(spbhid) => {
                let session = state.tracker.hls_by_spbhid(&spbhid).await?;
                state.router.route(&session.stream_url).await?
            }
            None => state.router.route(unified).await?,
        }
    } else {
        state.router.route(unified).await?
    };

    // Playlist requests open (or refresh) the HLS session.
    if extension == ".m3u8" {
        let session = state
            .tracker
            .register_hls(unified, HlsPlayStream {
                stream_url: unified.to_string(),
                full_url: full.to_string(),
                spbhid: format!("sp-{}", generate_context_id()),
            })
            .await?;
        debug!(stream_url = unified, spbhid = %session.spbhid, "hls session");
    }

    let target = if query.is_empty() {
        format!("http://{}:{}{}", backend.ip, backend.http_port()?, path)
    } else {
        format!("http://{}:{}{}?{}", backend.ip, backend.http_port()?, path, query)
    };

    let upstream = state
        .client
        .get(&target)
        .header(header::HOST, host)
        .send()
        .await
        .map_err(|e| ProxyError::BackendUnavailable(format!("get {target}: {e}")))?;

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::BackendUnavailable(format!("relay {target}: {e}")))
}

fn host_of(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key && !v.is_empty() {
            Some(v.to_string())
        } else {
            None
        }
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extraction() {
        assert_eq!(query_param("app=live&stream=show", "app").as_deref(), Some("live"));
        assert_eq!(query_param("app=live&stream=show", "stream").as_deref(), Some("show"));
        assert_eq!(query_param("spbhid=", "spbhid"), None);
        assert_eq!(query_param("", "app"), None);
    }

    #[test]
    fn media_extension_set() {
        for ext in [".flv", ".m3u8", ".ts", ".aac", ".mp3"] {
            assert!(MEDIA_EXTENSIONS.contains(&ext));
        }
        assert!(!MEDIA_EXTENSIONS.contains(&".html"));
    }
}
