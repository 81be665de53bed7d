//! Per-protocol forwarders.
//!
//! Each server derives the routing key through the demux layer, resolves a
//! backend through the router, and then moves bytes. None of them parse
//! media payloads.

mod amf0;
mod http;
mod http_api;
mod rtc;
mod rtmp;
mod srt;

pub use http::run_http_server;
pub use http_api::run_http_api_server;
pub use rtc::run_webrtc_server;
pub use rtmp::run_rtmp_server;
pub use srt::run_srt_server;

use axum::http::StatusCode;

use crate::error::ProxyError;

/// HTTP status a surfaced core error maps to.
pub(crate) fn status_for(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        ProxyError::Protocol(_) => StatusCode::BAD_REQUEST,
        ProxyError::NoBackendAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
