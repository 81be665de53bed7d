//! HTTP API forwarder: WHIP and WHEP.
//!
//! The SDP offer is forwarded to the routed backend's API endpoint; the
//! answer's ICE credentials key the WebRTC session so that STUN traffic
//! arriving on the UDP port can be steered to the same backend.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::demux::{parse_ice_ufrag_pwd, unify_http_url};
use crate::error::{ProxyError, Result};
use crate::router::StreamRouter;
use crate::session::{RtcConnection, SessionTracker};

use super::status_for;

#[derive(Clone)]
struct ApiProxyState {
    router: StreamRouter,
    tracker: SessionTracker,
    client: reqwest::Client,
}

/// Run the HTTP API server until cancelled.
pub async fn run_http_api_server(
    router: StreamRouter,
    tracker: SessionTracker,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let state = ApiProxyState {
        router,
        tracker,
        client: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/rtc/v1/whip/", post(whip_whep))
        .route("/rtc/v1/whep/", post(whip_whep))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ProxyError::io("bind http api", e))?;
    info!(port, "http api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ProxyError::io("serve http api", e))
}

async fn whip_whep(
    State(state): State<ApiProxyState>,
    uri: Uri,
    headers: HeaderMap,
    offer: String,
) -> Response {
    match forward_negotiation(&state, &uri, &headers, offer).await {
        Ok(response) => response,
        Err(e) => {
            warn!(path = uri.path(), error = %e, "whip/whep forward failed");
            (status_for(&e), format!("{e}\n")).into_response()
        }
    }
}

async fn forward_negotiation(
    state: &ApiProxyState,
    uri: &Uri,
    headers: &HeaderMap,
    offer: String,
) -> Result<Response> {
    let query = uri.query().unwrap_or("");
    let app = query_param(query, "app")
        .ok_or_else(|| ProxyError::Protocol("missing app parameter".into()))?;
    let stream = query_param(query, "stream")
        .ok_or_else(|| ProxyError::Protocol("missing stream parameter".into()))?;

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let unified = unify_http_url("webrtc", host, uri.path(), Some(&app), Some(&stream));

    let backend = state.router.route(&unified.unified).await?;
    let target = format!(
        "http://{}:{}{}?{}",
        backend.ip,
        backend.api_port()?,
        uri.path(),
        query
    );

    let upstream = state
        .client
        .post(&target)
        .header(header::CONTENT_TYPE, "application/sdp")
        .body(offer)
        .send()
        .await
        .map_err(|e| ProxyError::BackendUnavailable(format!("post {target}: {e}")))?;
    let status = upstream.status();
    let answer = upstream
        .text()
        .await
        .map_err(|e| ProxyError::BackendUnavailable(format!("read {target}: {e}")))?;

    if status.is_success() {
        let (ufrag, _pwd) = parse_ice_ufrag_pwd(&answer)?;
        state
            .tracker
            .register_webrtc(&unified.unified, RtcConnection {
                stream_url: unified.unified.clone(),
                ufrag: ufrag.clone(),
            })
            .await?;
        info!(stream_url = %unified.unified, %ufrag, backend = %backend.id(), "webrtc session routed");
    }

    Ok((
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        [(header::CONTENT_TYPE, "application/sdp")],
        answer,
    )
        .into_response())
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
