//! End-to-end routing behavior over the in-memory state backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use nagare::{
    BackendServer, HlsPlayStream, LoadBalancer, MemoryLoadBalancer, ProxyError, RtcConnection,
    SessionTracker, StreamRouter,
};

fn server(id: &str, ip: &str) -> BackendServer {
    BackendServer {
        server_id: id.into(),
        service_id: "x".into(),
        pid: "1".into(),
        ip: ip.into(),
        device_id: None,
        rtmp: vec!["1935".into()],
        http: vec!["8080".into()],
        api: vec!["1985".into()],
        srt: vec![],
        rtc: vec!["udp://8000".into()],
        updated_at: SystemTime::now(),
    }
}

fn balancer() -> Arc<MemoryLoadBalancer> {
    Arc::new(MemoryLoadBalancer::new())
}

#[tokio::test]
async fn single_backend_single_stream() {
    let lb = balancer();
    lb.update(&server("A", "10.0.0.1")).await.unwrap();

    let url = "rtmp://__defaultVhost__/live/stream";
    let first = lb.pick(url).await.unwrap();
    assert_eq!(first.ip, "10.0.0.1");
    for _ in 0..2 {
        assert_eq!(lb.pick(url).await.unwrap().id(), first.id());
    }
}

#[tokio::test]
async fn two_backends_stay_sticky_per_stream() {
    let lb = balancer();
    lb.update(&server("A", "10.0.0.1")).await.unwrap();
    lb.update(&server("B", "10.0.0.2")).await.unwrap();

    let router = StreamRouter::new(lb.clone() as Arc<dyn LoadBalancer>);

    let s1 = router.route("rtmp://__defaultVhost__/live/s1").await.unwrap();
    assert!(["A", "B"].contains(&s1.server_id.as_str()));
    for _ in 0..5 {
        let again = router.route("rtmp://__defaultVhost__/live/s1").await.unwrap();
        assert_eq!(again.id(), s1.id());
    }

    // A different stream may pick differently, but stays within the fleet.
    let s2 = router.route("rtmp://__defaultVhost__/live/s2").await.unwrap();
    assert!(["A", "B"].contains(&s2.server_id.as_str()));
}

#[tokio::test]
async fn distinct_streams_reach_every_backend() {
    let lb = balancer();
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
async fn empty_registry_refuses_pick() {
    let lb = balancer();
    assert!(matches!(
        lb.pick("rtmp://__defaultVhost__/live/s").await.unwrap_err(),
        ProxyError::NoBackendAvailable { .. }
    ));
}

#[tokio::test]
async fn hls_session_found_by_segment_id() {
    let lb = balancer();
    lb.update(&server("A", "10.0.0.1")).await.unwrap();
    let tracker = SessionTracker::new(lb.clone() as Arc<dyn LoadBalancer>);

    let url = "http://__defaultVhost__/live/s";
    let record = HlsPlayStream {
        stream_url: url.into(),
        full_url: format!("{url}.m3u8"),
        spbhid: "sp-abc".into(),
    };
    let stored = tracker.register_hls(url, record.clone()).await.unwrap();
    assert_eq!(stored, record);

    let loaded = tracker.hls_by_spbhid("sp-abc").await.unwrap();
    assert_eq!(loaded, record);

    // Segment requests route through the session's stream URL to the same
    // backend as the playlist.
    let playlist_backend = lb.pick(url).await.unwrap();
    let segment_backend = lb.pick(&loaded.stream_url).await.unwrap();
    assert_eq!(playlist_backend.id(), segment_backend.id());
}

#[tokio::test]
async fn webrtc_session_found_by_ufrag() {
    let lb = balancer();
    lb.update(&server("A", "10.0.0.1")).await.unwrap();
    let tracker = SessionTracker::new(lb.clone() as Arc<dyn LoadBalancer>);

    let url = "webrtc://__defaultVhost__/live/s";
    tracker
        .register_webrtc(url, RtcConnection { stream_url: url.into(), ufrag: "Dq2X".into() })
        .await
        .unwrap();

    let session = tracker.webrtc_by_ufrag("Dq2X").await.unwrap();
    assert_eq!(session.stream_url, url);

    assert!(matches!(
        tracker.webrtc_by_ufrag("gone").await.unwrap_err(),
        ProxyError::SessionNotFound { .. }
    ));
}

#[tokio::test]
async fn replayed_heartbeats_keep_one_backend() {
    let lb = balancer();
    let a = server("A", "10.0.0.1");
    for _ in 0..5 {
        lb.update(&a).await.unwrap();
    }

    let mut seen = HashSet::new();
    for i in 0..50 {
        let picked = lb.pick(&format!("rtmp://__defaultVhost__/live/r{i}")).await.unwrap();
        seen.insert(picked.id());
    }
    assert_eq!(seen.len(), 1);
}
