//! System API: the endpoint where origin servers register and heartbeat.
//!
//! Origins POST their descriptor every 30 seconds; each receipt refreshes
//! the liveness window. Responses always carry permissive CORS headers.

use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendServer;
use crate::balancer::LoadBalancer;
use crate::error::{ProxyError, Result};

/// Registration body sent by an origin server.
#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    server: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    pid: String,
    #[serde(default)]
    rtmp: Vec<String>,
    #[serde(default)]
    http: Vec<String>,
    #[serde(default)]
    api: Vec<String>,
    #[serde(default)]
    srt: Vec<String>,
    #[serde(default)]
    rtc: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    code: i32,
    pid: String,
}

#[derive(Clone)]
struct ApiState {
    lb: Arc<dyn LoadBalancer>,
}

/// Run the system API server until cancelled.
pub async fn run_system_api(
    lb: Arc<dyn LoadBalancer>,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = system_api_router(lb);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ProxyError::io("bind system api", e))?;
    info!(port, "system api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ProxyError::io("serve system api", e))
}

/// The system API routes, separated from the listener for tests.
pub fn system_api_router(lb: Arc<dyn LoadBalancer>) -> Router {
    Router::new()
        .route("/api/v1/srs/register", post(register))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(ApiState { lb })
}

async fn register(State(state): State<ApiState>, body: Bytes) -> Response {
    match handle_register(&state, &body).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            warn!(error = %e, "registration failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response()
        }
    }
}

async fn handle_register(state: &ApiState, body: &[u8]) -> Result<RegisterResponse> {
    let request: RegisterRequest = serde_json::from_slice(body)
        .map_err(|e| ProxyError::ConfigInvalid(format!("bad registration body: {e}")))?;

    let server = descriptor_from_request(request)?;
    debug!(id = %server.id(), ip = %server.ip, "origin heartbeat");
    state.lb.update(&server).await?;

    Ok(RegisterResponse { code: 0, pid: std::process::id().to_string() })
}

fn descriptor_from_request(request: RegisterRequest) -> Result<BackendServer> {
    if request.ip.is_empty() {
        return Err(ProxyError::ConfigInvalid("registration missing ip".into()));
    }
    if request.server.is_empty() || request.service.is_empty() || request.pid.is_empty() {
        return Err(ProxyError::ConfigInvalid("registration missing identity".into()));
    }
    if request.rtmp.is_empty() {
        return Err(ProxyError::ConfigInvalid("registration missing rtmp endpoints".into()));
    }

    Ok(BackendServer {
        server_id: request.server,
        service_id: request.service,
        pid: request.pid,
        ip: request.ip,
        device_id: request.device_id,
        rtmp: request.rtmp,
        http: request.http,
        api: request.api,
        srt: request.srt,
        rtc: request.rtc,
        updated_at: SystemTime::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> Result<BackendServer> {
        let request: RegisterRequest = serde_json::from_str(body).unwrap();
        descriptor_from_request(request)
    }

    #[test]
    fn full_registration_builds_descriptor() {
        let server = request(
            r#"{"ip":"10.0.0.1","server":"A","service":"x","pid":"1",
                "rtmp":["1935"],"http":["8080"],"device_id":"cam-1"}"#,
        )
        .unwrap();
        assert_eq!(server.id(), "A-x-1");
        assert_eq!(server.device_id.as_deref(), Some("cam-1"));
        assert_eq!(server.http, vec!["8080".to_string()]);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let missing_ip = r#"{"server":"A","service":"x","pid":"1","rtmp":["1935"]}"#;
        assert!(matches!(request(missing_ip), Err(ProxyError::ConfigInvalid(_))));

        let missing_rtmp = r#"{"ip":"10.0.0.1","server":"A","service":"x","pid":"1"}"#;
        assert!(matches!(request(missing_rtmp), Err(ProxyError::ConfigInvalid(_))));

        let missing_identity = r#"{"ip":"10.0.0.1","server":"","service":"x","pid":"1","rtmp":["1935"]}"#;
        assert!(matches!(request(missing_identity), Err(ProxyError::ConfigInvalid(_))));
    }
}
