//! Backend descriptor: identity and per-protocol endpoints of one origin
//! media server.
//!
//! A descriptor is created when an origin first registers, refreshed by each
//! heartbeat, and keyed in the registry by [`BackendServer::id`], which
//! changes whenever the origin process restarts.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// One origin media server, as registered over the system API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendServer {
    /// Stable identity of the server host; survives restarts.
    #[serde(rename = "server")]
    pub server_id: String,
    /// Identity of the current process incarnation; changes on restart.
    #[serde(rename = "service")]
    pub service_id: String,
    /// OS process id of the origin.
    pub pid: String,
    /// Reachable address of the origin.
    pub ip: String,
    /// Optional human label for the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// RTMP listen endpoints; never empty for a valid registration.
    pub rtmp: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub srt: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtc: Vec<String>,
    /// Wall-clock time of the last heartbeat receipt.
    #[serde(default = "SystemTime::now")]
    pub updated_at: SystemTime,
}

impl BackendServer {
    /// Registry key for this incarnation. Two registrations with an equal id
    /// are the same instance; the later one supersedes.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.server_id, self.service_id, self.pid)
    }

    /// Whether the last heartbeat was received within `window`.
    pub fn alive_within(&self, window: Duration) -> bool {
        match self.updated_at.elapsed() {
            Ok(elapsed) => elapsed < window,
            // Clock went backwards; the heartbeat is in the future, so alive.
            Err(_) => true,
        }
    }

    /// Port of the first RTMP endpoint.
    pub fn rtmp_port(&self) -> Result<u16> {
        first_port(&self.rtmp, "rtmp", &self.id())
    }

    /// Port of the first HTTP endpoint.
    pub fn http_port(&self) -> Result<u16> {
        first_port(&self.http, "http", &self.id())
    }

    /// Port of the first API endpoint.
    pub fn api_port(&self) -> Result<u16> {
        first_port(&self.api, "api", &self.id())
    }

    /// Port of the first WebRTC (UDP) endpoint.
    pub fn rtc_port(&self) -> Result<u16> {
        first_port(&self.rtc, "rtc", &self.id())
    }

    /// Port of the first SRT (UDP) endpoint.
    pub fn srt_port(&self) -> Result<u16> {
        first_port(&self.srt, "srt", &self.id())
    }
}

fn first_port(endpoints: &[String], protocol: &str, id: &str) -> Result<u16> {
    let ep = endpoints.first().ok_or_else(|| {
        ProxyError::ConfigInvalid(format!("backend {id} has no {protocol} endpoint"))
    })?;
    Ok(ep.parse::<ListenEndpoint>()?.port)
}

/// A parsed listen endpoint of an origin server.
///
/// The string grammar accepts, in order of likelihood:
/// - a bare decimal port, e.g. `1935` (TCP, any address);
/// - `proto://host:port` or `proto://port`, e.g. `tcp://0.0.0.0:1935`;
/// - legacy `proto:ip:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub protocol: String,
    /// Listen address; `None` means any.
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl FromStr for ListenEndpoint {
    type Err = ProxyError;

    fn from_str(ep: &str) -> Result<Self> {
        // Bare port.
        if !ep.contains(':') {
            let port = ep
                .parse()
                .map_err(|_| ProxyError::ConfigInvalid(format!("bad endpoint port {ep}")))?;
            return Ok(Self { protocol: "tcp".into(), ip: None, port });
        }

        // URL style: proto://host:port or proto://port.
        if let Some((protocol, host_port)) = ep.split_once("://") {
            let (host, port) = match split_host_port(host_port) {
                Some((host, port)) => (host, port),
                None => ("", host_port),
            };
            let port = port
                .parse()
                .map_err(|_| ProxyError::ConfigInvalid(format!("bad endpoint port in {ep}")))?;
            return Ok(Self {
                protocol: protocol.to_string(),
                ip: if host.is_empty() { None } else { host.parse().ok() },
                port,
            });
        }

        // Legacy proto:ip:port.
        let parts: Vec<&str> = ep.split(':').collect();
        if parts.len() != 3 {
            return Err(ProxyError::ConfigInvalid(format!("invalid endpoint {ep}")));
        }
        let port = parts[2]
            .parse()
            .map_err(|_| ProxyError::ConfigInvalid(format!("bad endpoint port in {ep}")))?;
        Ok(Self {
            protocol: parts[0].to_string(),
            ip: parts[1].parse().ok(),
            port,
        })
    }
}

/// Split `host:port`, handling a bracketed IPv6 host. Returns `None` when no
/// port separator is present.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        return Some((host, rest.strip_prefix(':')?));
    }
    s.rsplit_once(':')
}

/// Short random identifier, for generated server ids and session handles.
pub fn generate_context_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> BackendServer {
        BackendServer {
            server_id: id.into(),
            service_id: "svc".into(),
            pid: "1".into(),
            ip: "10.0.0.1".into(),
            device_id: None,
            rtmp: vec!["1935".into()],
            http: vec![],
            api: vec![],
            srt: vec![],
            rtc: vec![],
            updated_at: SystemTime::now(),
        }
    }

    #[test]
    fn id_is_incarnation_key() {
        assert_eq!(server("A").id(), "A-svc-1");
    }

    #[test]
    fn liveness_window() {
        let mut s = server("A");
        assert!(s.alive_within(Duration::from_secs(300)));

        s.updated_at = SystemTime::now() - Duration::from_secs(301);
        assert!(!s.alive_within(Duration::from_secs(300)));
    }

    #[test]
    fn endpoint_bare_port() {
        let ep: ListenEndpoint = "1935".parse().unwrap();
        assert_eq!(ep, ListenEndpoint { protocol: "tcp".into(), ip: None, port: 1935 });
    }

    #[test]
    fn endpoint_url_forms() {
        let ep: ListenEndpoint = "tcp://0.0.0.0:1935".parse().unwrap();
        assert_eq!(ep.protocol, "tcp");
        assert_eq!(ep.ip, Some("0.0.0.0".parse().unwrap()));
        assert_eq!(ep.port, 1935);

        let ep: ListenEndpoint = "udp://10080".parse().unwrap();
        assert_eq!(ep.protocol, "udp");
        assert_eq!(ep.ip, None);
        assert_eq!(ep.port, 10080);

        let ep: ListenEndpoint = "tcp://:1935".parse().unwrap();
        assert_eq!(ep.ip, None);
        assert_eq!(ep.port, 1935);
    }

    #[test]
    fn endpoint_legacy_form() {
        let ep: ListenEndpoint = "tcp:127.0.0.1:1935".parse().unwrap();
        assert_eq!(ep.protocol, "tcp");
        assert_eq!(ep.ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(ep.port, 1935);
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!("".parse::<ListenEndpoint>().is_err());
        assert!("tcp:1935".parse::<ListenEndpoint>().is_err());
        assert!("tcp://".parse::<ListenEndpoint>().is_err());
        assert!("not-a-port".parse::<ListenEndpoint>().is_err());
    }

    #[test]
    fn descriptor_round_trips_as_json() {
        let s = server("A");
        let json = serde_json::to_string(&s).unwrap();
        let back: BackendServer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), s.id());
        assert_eq!(back.rtmp, s.rtmp);
    }

    #[test]
    fn context_ids_are_short_and_distinct() {
        let a = generate_context_id();
        let b = generate_context_id();
        assert_eq!(a.len(), 7);
        assert_ne!(a, b);
    }
}
