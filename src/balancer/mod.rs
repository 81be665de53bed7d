//! State backend for the routing core.
//!
//! The registry of origin servers, the stream-to-backend routing table, and
//! the HLS/WebRTC session indices all live behind [`LoadBalancer`]. Two
//! variants exist: [`MemoryLoadBalancer`] keeps everything in-process for a
//! single proxy, [`RedisLoadBalancer`] shares state across a fleet of
//! proxies through Redis.

mod debug;
mod memory;
mod redis;

pub use debug::default_backend_for_debugging;
pub use memory::MemoryLoadBalancer;
pub use redis::RedisLoadBalancer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendServer;
use crate::config::{Config, LoadBalancerKind};
use crate::error::Result;
use crate::session::{HlsPlayStream, RtcConnection};

/// Window after the last heartbeat during which a descriptor is healthy.
pub const SERVER_ALIVE_DURATION: Duration = Duration::from_secs(300);

/// Lifetime of an HLS or WebRTC session record, refreshed on every store.
pub const SESSION_ALIVE_DURATION: Duration = Duration::from_secs(120);

/// Interval at which the debug default backend re-registers itself.
pub const DEFAULT_BACKEND_KEEPALIVE: Duration = Duration::from_secs(30);

/// Persists the server registry, routing table, and session indices.
///
/// All operations are safe under arbitrary concurrent invocation. Shared
/// variants may suspend on network I/O; callers bound such calls with their
/// ambient cancellation context.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Establish any external connection and, when configured, register the
    /// debug default backend and launch its keepalive.
    async fn initialize(&self, config: &Config, cancel: CancellationToken) -> Result<()>;

    /// Store or refresh a descriptor under its incarnation id, with
    /// `updated_at` set to now. Idempotent.
    async fn update(&self, server: &BackendServer) -> Result<()>;

    /// Resolve a stream URL to a backend descriptor.
    ///
    /// Returns the recorded backend while it remains in the registry
    /// (stickiness); otherwise picks uniformly at random among alive
    /// descriptors, falling back to stale ones, and records the choice.
    async fn pick(&self, stream_url: &str) -> Result<BackendServer>;

    /// Store the record under both the stream URL and its spbhid unless a
    /// record for the URL already exists; either way return the winner with
    /// refreshed TTLs.
    async fn load_or_store_hls(&self, stream_url: &str, value: HlsPlayStream) -> Result<HlsPlayStream>;

    /// Look up an HLS session record by segment identifier.
    async fn load_hls_by_spbhid(&self, spbhid: &str) -> Result<HlsPlayStream>;

    /// Write a WebRTC record under both the stream URL and its ufrag,
    /// overwriting and refreshing TTLs.
    async fn store_webrtc(&self, stream_url: &str, value: RtcConnection) -> Result<()>;

    /// Look up a WebRTC session record by ICE username fragment.
    async fn load_webrtc_by_ufrag(&self, ufrag: &str) -> Result<RtcConnection>;
}

/// Construct the state backend selected by the configuration.
pub fn new_load_balancer(config: &Config) -> Arc<dyn LoadBalancer> {
    match config.load_balancer {
        LoadBalancerKind::Memory => Arc::new(MemoryLoadBalancer::new()),
        LoadBalancerKind::Redis => Arc::new(RedisLoadBalancer::new(config.redis_url())),
    }
}
