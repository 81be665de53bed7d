//! Canonical stream URL derivation for HTTP and RTMP requests.

use std::net::Ipv4Addr;

use crate::error::{ProxyError, Result};

/// Vhost token used when a request carries no usable hostname.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// A request URL unified into the canonical routing form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedStreamUrl {
    /// `scheme://vhost/app/stream`, without extension. The routing key.
    pub unified: String,
    /// The unified URL with the request extension kept.
    pub full: String,
    /// Extension including the dot, e.g. `.m3u8`; empty when none.
    pub extension: String,
}

/// Map a `Host` header (or SRT `h=` value) to the canonical vhost.
///
/// The port is stripped; a literal IPv4 address or a hostname without a dot
/// is not a usable vhost and becomes [`DEFAULT_VHOST`].
pub fn vhost_for_host(host: &str) -> String {
    let hostname = host_without_port(host);
    if hostname.is_empty()
        || !hostname.contains('.')
        || hostname.parse::<Ipv4Addr>().is_ok()
    {
        DEFAULT_VHOST.to_string()
    } else {
        hostname.to_string()
    }
}

fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, with or without a port.
        return rest.split_once(']').map(|(h, _)| h).unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal, not a port.
        Some((h, _)) if !h.contains(':') => h,
        _ => host,
    }
}

/// Unify an HTTP request into the canonical stream URL.
///
/// When the query string supplies `app`/`stream`, they form the stream path
/// and the extension is empty; otherwise the path is split at the final dot
/// of its last segment.
pub fn unify_http_url(
    scheme: &str,
    host: &str,
    path: &str,
    app: Option<&str>,
    stream: Option<&str>,
) -> UnifiedStreamUrl {
    let vhost = vhost_for_host(host);

    let mut app_stream = String::new();
    if let Some(app) = app.filter(|v| !v.is_empty()) {
        app_stream.push('/');
        app_stream.push_str(app);
    }
    if let Some(stream) = stream.filter(|v| !v.is_empty()) {
        app_stream.push('/');
        app_stream.push_str(stream);
    }

    let extension = if app_stream.is_empty() {
        let ext = path_extension(path);
        app_stream = path[..path.len() - ext.len()].to_string();
        ext.to_string()
    } else {
        String::new()
    };

    let unified = format!("{scheme}://{vhost}{app_stream}");
    let full = format!("{unified}{extension}");
    UnifiedStreamUrl { unified, full, extension }
}

/// Extension of the last path segment, including the dot; empty when none.
fn path_extension(path: &str) -> &str {
    let segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[segment_start..].rfind('.') {
        Some(dot) => &path[segment_start + dot..],
        None => "",
    }
}

/// Derive the canonical stream URL from RTMP connect and publish/play
/// parameters: the `tcUrl` supplies vhost and app, the stream name the rest.
pub fn rtmp_stream_url(tc_url: &str, stream: &str) -> Result<String> {
    let rest = tc_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| ProxyError::Protocol(format!("bad tcUrl {tc_url}")))?;

    let (host, app) = match rest.split_once('/') {
        Some((host, app)) => (host, app),
        None => (rest, ""),
    };
    let app = app.split(['?', '#']).next().unwrap_or("");
    if app.is_empty() {
        return Err(ProxyError::Protocol(format!("no app in tcUrl {tc_url}")));
    }

    let stream = stream.split(['?', '#']).next().unwrap_or("");
    if stream.is_empty() {
        return Err(ProxyError::Protocol("empty stream name".into()));
    }

    Ok(format!("rtmp://{}/{}/{}", vhost_for_host(host), app, stream))
}
