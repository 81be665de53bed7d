//! Protocol demultiplexers.
//!
//! Each wire protocol derives the same canonical stream URL —
//! `scheme://vhost/app/stream` — before any application-layer conversation
//! with a backend, so the routing decision can be made up front. UDP traffic
//! is additionally steered between the WebRTC and SRT paths by inspecting
//! the first bytes of each datagram.

mod packet;
mod sdp;
mod stream_url;

pub use packet::{
    classify_udp_payload, parse_srt_stream_id, srt_socket_id, stun_username_ufrag, SrtStreamId,
    UdpPayloadKind,
};
pub use sdp::parse_ice_ufrag_pwd;
pub use stream_url::{
    rtmp_stream_url, unify_http_url, vhost_for_host, UnifiedStreamUrl, DEFAULT_VHOST,
};
