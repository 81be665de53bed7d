//! Nagare — stateless media-streaming proxy for fleets of origin servers.
//!
//! Clients speak RTMP, HTTP-FLV/HLS/TS, WebRTC (WHIP/WHEP) or SRT to the
//! proxy as if it were an origin; the proxy selects a healthy backend and
//! forwards the session there, guaranteeing that every request belonging to
//! the same logical stream lands on the same backend.
//!
//! The crate is built from four layers:
//!
//! 1. **State backend** — the server registry, stream routing table, and
//!    session indices, in-process or shared through Redis ([`balancer`]).
//! 2. **Demux** — derives the canonical `scheme://vhost/app/stream` routing
//!    key from whichever wire input arrives ([`demux`]).
//! 3. **Forwarders** — per-protocol servers that splice client traffic to
//!    the routed backend ([`proxy`]).
//! 4. **System API** — where origins register and heartbeat ([`api`]).

pub mod api;
pub mod backend;
pub mod balancer;
pub mod config;
pub mod demux;
pub mod error;
pub mod proxy;
pub mod router;
pub mod session;

pub use backend::{BackendServer, ListenEndpoint};
pub use balancer::{
    new_load_balancer, LoadBalancer, MemoryLoadBalancer, RedisLoadBalancer,
    SERVER_ALIVE_DURATION, SESSION_ALIVE_DURATION,
};
pub use config::{Config, LoadBalancerKind};
pub use error::{ProxyError, Result};
pub use router::StreamRouter;
pub use session::{HlsPlayStream, RtcConnection, SessionTracker};
