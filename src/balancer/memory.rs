//! In-process state backend for a single proxy instance.
//!
//! Every table is a concurrent map with independent per-key updates; no
//! operation takes a global lock. Dead descriptors are kept indefinitely
//! and filtered out at pick time.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::BackendServer;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::session::{HlsPlayStream, RtcConnection};

use super::{default_backend_for_debugging, LoadBalancer, SERVER_ALIVE_DURATION};

/// State backend backed by in-process maps.
#[derive(Clone, Default)]
pub struct MemoryLoadBalancer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// All registered servers, keyed by incarnation id.
    servers: DashMap<String, BackendServer>,
    /// The backend picked for each stream URL, keyed by stream URL.
    picked: DashMap<String, String>,
    /// HLS sessions by stream URL, for playlist requests.
    hls_by_url: DashMap<String, HlsPlayStream>,
    /// HLS sessions by spbhid, for segment requests.
    hls_by_spbhid: DashMap<String, HlsPlayStream>,
    /// WebRTC sessions by stream URL.
    rtc_by_url: DashMap<String, RtcConnection>,
    /// WebRTC sessions by ufrag, for arriving STUN traffic.
    rtc_by_ufrag: DashMap<String, RtcConnection>,
}

impl MemoryLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadBalancer for MemoryLoadBalancer {
    async fn initialize(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        if let Some(server) = default_backend_for_debugging(config)? {
            self.update(&server).await?;
            debug!(id = %server.id(), "memory: registered default backend");
            super::debug::spawn_keepalive(self.clone(), server, cancel);
        }
        Ok(())
    }

    async fn update(&self, server: &BackendServer) -> Result<()> {
        let mut server = server.clone();
        server.updated_at = SystemTime::now();
        self.inner.servers.insert(server.id(), server);
        Ok(())
    }

    async fn pick(&self, stream_url: &str) -> Result<BackendServer> {
        // Always proxy the same stream URL to the same backend, as long as
        // that backend is still registered.
        if let Some(id) = self.inner.picked.get(stream_url).map(|r| r.clone()) {
            if let Some(server) = self.inner.servers.get(&id).map(|r| r.clone()) {
                return Ok(server);
            }
        }

        // Prefer servers heard from within the liveness window.
        let mut candidates: Vec<BackendServer> = self
            .inner
            .servers
            .iter()
            .filter(|r| r.alive_within(SERVER_ALIVE_DURATION))
            .map(|r| r.value().clone())
            .collect();

        // Fall back to every known server, stale or not.
        if candidates.is_empty() {
            candidates = self.inner.servers.iter().map(|r| r.value().clone()).collect();
        }

        if candidates.is_empty() {
            return Err(ProxyError::NoBackendAvailable { stream_url: stream_url.to_string() });
        }

        let server = candidates[rand::rng().random_range(0..candidates.len())].clone();
        self.inner.picked.insert(stream_url.to_string(), server.id());
        Ok(server)
    }

    async fn load_or_store_hls(&self, stream_url: &str, value: HlsPlayStream) -> Result<HlsPlayStream> {
        // The URL index is written first; a reader that observes it will see
        // the spbhid index on a retry.
        let actual = self
            .inner
            .hls_by_url
            .entry(stream_url.to_string())
            .or_insert(value)
            .clone();
        self.inner.hls_by_spbhid.insert(actual.spbhid.clone(), actual.clone());
        Ok(actual)
    }

    async fn load_hls_by_spbhid(&self, spbhid: &str) -> Result<HlsPlayStream> {
        self.inner
            .hls_by_spbhid
            .get(spbhid)
            .map(|r| r.clone())
            .ok_or_else(|| ProxyError::SessionNotFound { kind: "HLS", key: spbhid.to_string() })
    }

    async fn store_webrtc(&self, stream_url: &str, value: RtcConnection) -> Result<()> {
        self.inner.rtc_by_url.insert(stream_url.to_string(), value.clone());
        self.inner.rtc_by_ufrag.insert(value.ufrag.clone(), value);
        Ok(())
    }

    async fn load_webrtc_by_ufrag(&self, ufrag: &str) -> Result<RtcConnection> {
        self.inner
            .rtc_by_ufrag
            .get(ufrag)
            .map(|r| r.clone())
            .ok_or_else(|| ProxyError::SessionNotFound { kind: "WebRTC", key: ufrag.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn server(id: &str, ip: &str) -> BackendServer {
        BackendServer {
            server_id: id.into(),
            service_id: "svc".into(),
            pid: "1".into(),
            ip: ip.into(),
            device_id: None,
            rtmp: vec!["1935".into()],
            http: vec![],
            api: vec![],
            srt: vec![],
            rtc: vec![],
            updated_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn pick_is_sticky() {
        let lb = MemoryLoadBalancer::new();
        lb.update(&server("A", "10.0.0.1")).await.unwrap();
        lb.update(&server("B", "10.0.0.2")).await.unwrap();

        let url = "rtmp://__defaultVhost__/live/s1";
        let first = lb.pick(url).await.unwrap();
        for _ in 0..5 {
            assert_eq!(lb.pick(url).await.unwrap().id(), first.id());
        }
    }

    #[tokio::test]
    async fn pick_fails_on_empty_registry() {
        let lb = MemoryLoadBalancer::new();
        let err = lb.pick("rtmp://__defaultVhost__/live/s").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoBackendAvailable { .. }));
    }

    #[tokio::test]
    async fn update_is_idempotent() {
        let lb = MemoryLoadBalancer::new();
        let s = server("A", "10.0.0.1");
        for _ in 0..5 {
            lb.update(&s).await.unwrap();
        }
        assert_eq!(lb.inner.servers.len(), 1);
    }

    #[tokio::test]
    async fn stale_backends_not_picked_while_alive_one_exists() {
        let lb = MemoryLoadBalancer::new();

        let mut stale = server("A", "10.0.0.1");
        stale.updated_at = SystemTime::now() - Duration::from_secs(301);
        // Insert directly to keep the stale timestamp.
        lb.inner.servers.insert(stale.id(), stale);
        lb.update(&server("B", "10.0.0.2")).await.unwrap();

        for i in 0..20 {
            let picked = lb.pick(&format!("rtmp://__defaultVhost__/live/s{i}")).await.unwrap();
            assert_eq!(picked.server_id, "B");
        }
    }

    #[tokio::test]
    async fn stale_backend_is_fallback_when_alone() {
        let lb = MemoryLoadBalancer::new();
        let mut stale = server("A", "10.0.0.1");
        stale.updated_at = SystemTime::now() - Duration::from_secs(301);
        lb.inner.servers.insert(stale.id(), stale);

        let picked = lb.pick("rtmp://__defaultVhost__/live/s").await.unwrap();
        assert_eq!(picked.server_id, "A");
    }

    #[tokio::test]
    async fn random_pick_covers_all_backends() {
        let lb = MemoryLoadBalancer::new();
        for i in 0..3 {
            lb.update(&server(&format!("S{i}"), "10.0.0.1")).await.unwrap();
        }

        let mut seen = HashSet::new();
        for i in 0..200 {
            let picked = lb.pick(&format!("rtmp://__defaultVhost__/live/u{i}")).await.unwrap();
            seen.insert(picked.server_id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn hls_dual_index() {
        let lb = MemoryLoadBalancer::new();
        let url = "http://__defaultVhost__/live/s";
        let record = HlsPlayStream {
            stream_url: url.into(),
            full_url: format!("{url}.m3u8"),
            spbhid: "sp-abc".into(),
        };

        let stored = lb.load_or_store_hls(url, record.clone()).await.unwrap();
        assert_eq!(stored, record);
        assert_eq!(lb.load_hls_by_spbhid("sp-abc").await.unwrap(), record);

        // A second store for the same URL keeps the first record.
        let other = HlsPlayStream {
            stream_url: url.into(),
            full_url: format!("{url}.m3u8"),
            spbhid: "sp-xyz".into(),
        };
        let kept = lb.load_or_store_hls(url, other).await.unwrap();
        assert_eq!(kept.spbhid, "sp-abc");
    }

    #[tokio::test]
    async fn webrtc_dual_index_overwrites() {
        let lb = MemoryLoadBalancer::new();
        let url = "webrtc://__defaultVhost__/live/s";

        lb.store_webrtc(url, RtcConnection { stream_url: url.into(), ufrag: "u1".into() })
            .await
            .unwrap();
        lb.store_webrtc(url, RtcConnection { stream_url: url.into(), ufrag: "u2".into() })
            .await
            .unwrap();

        assert_eq!(lb.load_webrtc_by_ufrag("u2").await.unwrap().stream_url, url);
        // The old ufrag index survives until its TTL in the shared variant;
        // in memory it simply remains pointing at the old record.
        assert!(lb.load_webrtc_by_ufrag("u1").await.is_ok());
        assert!(matches!(
            lb.load_webrtc_by_ufrag("missing").await.unwrap_err(),
            ProxyError::SessionNotFound { .. }
        ));
    }
}
