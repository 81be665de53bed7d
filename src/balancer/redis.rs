//! Shared state backend over Redis, for a fleet of proxy instances.
//!
//! Descriptors and session records are stored as JSON under a flat key
//! namespace. Liveness is delegated to Redis TTLs: descriptor keys expire
//! after the liveness window, session keys after the session TTL, and the
//! `all-servers` index (which has no TTL) is pruned of dangling keys on
//! every update.

use std::sync::OnceLock;
use std::time::SystemTime;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::BackendServer;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::session::{HlsPlayStream, RtcConnection, SessionRecord};

use super::{default_backend_for_debugging, LoadBalancer, SERVER_ALIVE_DURATION, SESSION_ALIVE_DURATION};

/// Probe attempts when a sampled descriptor vanished between the index read
/// and the per-key read.
const PICK_PROBES: usize = 3;

/// State backend backed by a shared Redis store.
#[derive(Clone)]
pub struct RedisLoadBalancer {
    url: String,
    conn: OnceLock<ConnectionManager>,
}

impl RedisLoadBalancer {
    pub fn new(url: String) -> Self {
        Self { url, conn: OnceLock::new() }
    }

    fn conn(&self) -> Result<ConnectionManager> {
        self.conn
            .get()
            .cloned()
            .ok_or_else(|| ProxyError::BackendUnavailable("redis not initialized".into()))
    }
}

fn key_server(server_id: &str) -> String {
    format!("srs-proxy-server:{server_id}")
}

fn key_servers() -> String {
    "srs-proxy-all-servers".to_string()
}

fn key_url(stream_url: &str) -> String {
    format!("srs-proxy-url:{stream_url}")
}

fn key_hls(stream_url: &str) -> String {
    format!("srs-proxy-hls:{stream_url}")
}

fn key_spbhid(spbhid: &str) -> String {
    format!("srs-proxy-spbhid:{spbhid}")
}

fn key_rtc(stream_url: &str) -> String {
    format!("srs-proxy-rtc:{stream_url}")
}

fn key_ufrag(ufrag: &str) -> String {
    format!("srs-proxy-ufrag:{ufrag}")
}

fn unavailable(operation: &str, key: &str, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::BackendUnavailable(format!("{operation} key={key}: {err}"))
}

fn decode_session(key: &str, raw: &str) -> Result<SessionRecord> {
    serde_json::from_str(raw).map_err(|e| ProxyError::SessionNotDeserializable {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl LoadBalancer for RedisLoadBalancer {
    async fn initialize(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| ProxyError::ConfigInvalid(format!("redis url {}: {e}", self.url)))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("connect {}: {e}", self.url)))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("ping {}: {e}", self.url)))?;
        debug!(url = %self.url, "redis: connected");

        // First initialization wins; later calls reuse the connection.
        let _ = self.conn.set(conn);

        if let Some(server) = default_backend_for_debugging(config)? {
            self.update(&server).await?;
            debug!(id = %server.id(), "redis: registered default backend");
            super::debug::spawn_keepalive(self.clone(), server, cancel);
        }
        Ok(())
    }

    async fn update(&self, server: &BackendServer) -> Result<()> {
        let mut conn = self.conn()?;

        let mut server = server.clone();
        server.updated_at = SystemTime::now();

        let key = key_server(&server.id());
        let body = serde_json::to_string(&server)
            .map_err(|e| unavailable("marshal server", &key, e))?;
        conn.set_ex::<_, _, ()>(&key, body, SERVER_ALIVE_DURATION.as_secs())
            .await
            .map_err(|e| unavailable("set server", &key, e))?;

        // Refresh the all-servers index: drop keys whose descriptors have
        // expired, then make sure our own key is present.
        let index_key = key_servers();
        let mut server_keys: Vec<String> = match conn
            .get::<_, Option<String>>(&index_key)
            .await
            .map_err(|e| unavailable("get servers", &index_key, e))?
        {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| unavailable("unmarshal servers", &index_key, e))?,
            None => Vec::new(),
        };

        let mut pruned = Vec::with_capacity(server_keys.len() + 1);
        for server_key in server_keys.drain(..) {
            let exists: bool = conn
                .exists(&server_key)
                .await
                .map_err(|e| unavailable("probe server", &server_key, e))?;
            if exists {
                pruned.push(server_key);
            }
        }
        if !pruned.contains(&key) {
            pruned.push(key);
        }

        let body = serde_json::to_string(&pruned)
            .map_err(|e| unavailable("marshal servers", &index_key, e))?;
        conn.set::<_, _, ()>(&index_key, body)
            .await
            .map_err(|e| unavailable("set servers", &index_key, e))?;

        Ok(())
    }

    async fn pick(&self, stream_url: &str) -> Result<BackendServer> {
        let mut conn = self.conn()?;
        let url_key = key_url(stream_url);

        // Sticky routing record: follow it while the descriptor still
        // exists; a dangling record is overwritten below.
        if let Some(server_key) = conn
            .get::<_, Option<String>>(&url_key)
            .await
            .map_err(|e| unavailable("get url", &url_key, e))?
        {
            if let Some(raw) = conn
                .get::<_, Option<String>>(&server_key)
                .await
                .map_err(|e| unavailable("get server", &server_key, e))?
            {
                return serde_json::from_str(&raw)
                    .map_err(|e| unavailable("unmarshal server", &server_key, e));
            }
        }

        let index_key = key_servers();
        let server_keys: Vec<String> = match conn
            .get::<_, Option<String>>(&index_key)
            .await
            .map_err(|e| unavailable("get servers", &index_key, e))?
        {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| unavailable("unmarshal servers", &index_key, e))?,
            None => Vec::new(),
        };
        if server_keys.is_empty() {
            return Err(ProxyError::NoBackendAvailable { stream_url: stream_url.to_string() });
        }

        // Index entries should all be alive; Redis expires the dead ones.
        // Tolerate a few that vanished between the index read and here.
        let mut chosen: Option<(String, BackendServer)> = None;
        for _ in 0..PICK_PROBES {
            let probe = &server_keys[rand::rng().random_range(0..server_keys.len())];
            if let Some(raw) = conn
                .get::<_, Option<String>>(probe)
                .await
                .map_err(|e| unavailable("get server", probe, e))?
            {
                let server = serde_json::from_str(&raw)
                    .map_err(|e| unavailable("unmarshal server", probe, e))?;
                chosen = Some((probe.clone(), server));
                break;
            }
        }
        let (server_key, server) = chosen.ok_or_else(|| ProxyError::NoBackendAvailable {
            stream_url: stream_url.to_string(),
        })?;

        conn.set::<_, _, ()>(&url_key, &server_key)
            .await
            .map_err(|e| unavailable("set url", &url_key, e))?;
        Ok(server)
    }

    async fn load_or_store_hls(&self, stream_url: &str, value: HlsPlayStream) -> Result<HlsPlayStream> {
        let mut conn = self.conn()?;
        let url_key = key_hls(stream_url);
        let ttl = SESSION_ALIVE_DURATION.as_secs();

        // Keep an existing record for this URL, refreshing both indices.
        if let Some(raw) = conn
            .get::<_, Option<String>>(&url_key)
            .await
            .map_err(|e| unavailable("get hls", &url_key, e))?
        {
            match decode_session(&url_key, &raw)? {
                SessionRecord::Hls(existing) => {
                    let spbhid_key = key_spbhid(&existing.spbhid);
                    conn.expire::<_, ()>(&url_key, ttl as i64)
                        .await
                        .map_err(|e| unavailable("refresh hls", &url_key, e))?;
                    conn.expire::<_, ()>(&spbhid_key, ttl as i64)
                        .await
                        .map_err(|e| unavailable("refresh hls", &spbhid_key, e))?;
                    return Ok(existing);
                }
                other => {
                    return Err(ProxyError::SessionNotDeserializable {
                        key: url_key,
                        reason: format!("unexpected record {other:?}"),
                    })
                }
            }
        }

        let body = serde_json::to_string(&SessionRecord::Hls(value.clone()))
            .map_err(|e| unavailable("marshal hls", &url_key, e))?;
        conn.set_ex::<_, _, ()>(&url_key, &body, ttl)
            .await
            .map_err(|e| unavailable("set hls", &url_key, e))?;

        let spbhid_key = key_spbhid(&value.spbhid);
        conn.set_ex::<_, _, ()>(&spbhid_key, &body, ttl)
            .await
            .map_err(|e| unavailable("set hls", &spbhid_key, e))?;

        Ok(value)
    }

    async fn load_hls_by_spbhid(&self, spbhid: &str) -> Result<HlsPlayStream> {
        let mut conn = self.conn()?;
        let key = key_spbhid(spbhid);

        let raw = conn
            .get::<_, Option<String>>(&key)
            .await
            .map_err(|e| unavailable("get hls", &key, e))?
            .ok_or_else(|| ProxyError::SessionNotFound { kind: "HLS", key: spbhid.to_string() })?;

        match decode_session(&key, &raw)? {
            SessionRecord::Hls(record) => Ok(record),
            other => Err(ProxyError::SessionNotDeserializable {
                key,
                reason: format!("unexpected record {other:?}"),
            }),
        }
    }

    async fn store_webrtc(&self, stream_url: &str, value: RtcConnection) -> Result<()> {
        let mut conn = self.conn()?;
        let ttl = SESSION_ALIVE_DURATION.as_secs();

        let url_key = key_rtc(stream_url);
        let body = serde_json::to_string(&SessionRecord::Rtc(value.clone()))
            .map_err(|e| unavailable("marshal rtc", &url_key, e))?;
        conn.set_ex::<_, _, ()>(&url_key, &body, ttl)
            .await
            .map_err(|e| unavailable("set rtc", &url_key, e))?;

        let ufrag_key = key_ufrag(&value.ufrag);
        conn.set_ex::<_, _, ()>(&ufrag_key, &body, ttl)
            .await
            .map_err(|e| unavailable("set rtc", &ufrag_key, e))?;

        Ok(())
    }

    async fn load_webrtc_by_ufrag(&self, ufrag: &str) -> Result<RtcConnection> {
        let mut conn = self.conn()?;
        let key = key_ufrag(ufrag);

        let raw = conn
            .get::<_, Option<String>>(&key)
            .await
            .map_err(|e| unavailable("get rtc", &key, e))?
            .ok_or_else(|| ProxyError::SessionNotFound { kind: "WebRTC", key: ufrag.to_string() })?;

        match decode_session(&key, &raw)? {
            SessionRecord::Rtc(record) => Ok(record),
            other => Err(ProxyError::SessionNotDeserializable {
                key,
                reason: format!("unexpected record {other:?}"),
            }),
        }
    }
}
