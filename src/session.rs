//! HLS and WebRTC session records, dual-indexed by the state backend.
//!
//! Records are concrete tagged types so the shared backend can always
//! rehydrate a complete record from its serialized form; the discriminator
//! travels with the payload as a `kind` field.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::LoadBalancer;
use crate::error::Result;

/// An HLS playback session.
///
/// Created when a playlist request is first routed; segment requests carry
/// the [`HlsPlayStream::spbhid`] so they land on the same backend as the
/// playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HlsPlayStream {
    /// Canonical stream URL, `scheme://vhost/app/stream`.
    pub stream_url: String,
    /// Stream URL with the request extension kept, e.g. `.m3u8`.
    pub full_url: String,
    /// Opaque backend-HLS session identifier embedded in segment URLs.
    pub spbhid: String,
}

/// A WebRTC session established during WHIP/WHEP negotiation.
///
/// STUN packets carry the [`RtcConnection::ufrag`] chosen by the backend, so
/// arriving media can be routed to the session's backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RtcConnection {
    /// Canonical stream URL, `scheme://vhost/app/stream`.
    pub stream_url: String,
    /// ICE username fragment from the backend's SDP answer.
    pub ufrag: String,
}

/// Wire form of a session record in the shared backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionRecord {
    Hls(HlsPlayStream),
    Rtc(RtcConnection),
}

/// Thin facade over the session operations of the state backend.
///
/// In the shared variant the two index writes are separate, so a reader may
/// observe one side before the other; lookups here retry briefly before
/// surfacing `SessionNotFound`.
#[derive(Clone)]
pub struct SessionTracker {
    lb: Arc<dyn LoadBalancer>,
}

/// Bounded retry for one-sided visibility of the dual-index write.
const LOOKUP_RETRIES: usize = 2;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(20);

impl SessionTracker {
    pub fn new(lb: Arc<dyn LoadBalancer>) -> Self {
        Self { lb }
    }

    /// Register an HLS session, keeping any session already indexed under
    /// this stream URL. Returns the winning record.
    pub async fn register_hls(&self, stream_url: &str, record: HlsPlayStream) -> Result<HlsPlayStream> {
        self.lb.load_or_store_hls(stream_url, record).await
    }

    /// Look up an HLS session by the segment identifier.
    pub async fn hls_by_spbhid(&self, spbhid: &str) -> Result<HlsPlayStream> {
        let mut last = self.lb.load_hls_by_spbhid(spbhid).await;
        for _ in 0..LOOKUP_RETRIES {
            if !matches!(last, Err(crate::error::ProxyError::SessionNotFound { .. })) {
                break;
            }
            tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            last = self.lb.load_hls_by_spbhid(spbhid).await;
        }
        last
    }

    /// Register a WebRTC session, overwriting any previous one for this
    /// stream URL.
    pub async fn register_webrtc(&self, stream_url: &str, record: RtcConnection) -> Result<()> {
        self.lb.store_webrtc(stream_url, record).await
    }

    /// Look up a WebRTC session by its ICE username fragment.
    pub async fn webrtc_by_ufrag(&self, ufrag: &str) -> Result<RtcConnection> {
        let mut last = self.lb.load_webrtc_by_ufrag(ufrag).await;
        for _ in 0..LOOKUP_RETRIES {
            if !matches!(last, Err(crate::error::ProxyError::SessionNotFound { .. })) {
                break;
            }
            tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            last = self.lb.load_webrtc_by_ufrag(ufrag).await;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_tag_their_kind() {
        let record = SessionRecord::Hls(HlsPlayStream {
            stream_url: "http://__defaultVhost__/live/s".into(),
            full_url: "http://__defaultVhost__/live/s.m3u8".into(),
            spbhid: "sp-abc".into(),
        });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""kind":"hls""#));

        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn rtc_record_round_trips() {
        let record = SessionRecord::Rtc(RtcConnection {
            stream_url: "webrtc://__defaultVhost__/live/s".into(),
            ufrag: "u1".into(),
        });
        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
