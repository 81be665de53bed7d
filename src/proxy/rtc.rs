//! WebRTC forwarder: UDP steering by ICE ufrag and peer address.
//!
//! The first STUN packet from a peer carries the ufrag negotiated during
//! WHIP/WHEP; it resolves the session and its backend, after which every
//! datagram from that peer follows the remembered flow. RTP/RTCP before a
//! flow exists is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::SESSION_ALIVE_DURATION;
use crate::demux::{classify_udp_payload, stun_username_ufrag, UdpPayloadKind};
use crate::error::{ProxyError, Result};
use crate::router::StreamRouter;
use crate::session::SessionTracker;

const MAX_DATAGRAM: usize = 2048;

/// Run the WebRTC UDP server until cancelled.
pub async fn run_webrtc_server(
    router: StreamRouter,
    tracker: SessionTracker,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ProxyError::io("bind webrtc", e))?,
    );
    info!(port, "webrtc server listening");

    let flows: Arc<DashMap<SocketAddr, Arc<UdpSocket>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => {
                received.map_err(|e| ProxyError::io("recv webrtc", e))?
            }
        };
        let data = &buf[..len];

        if let Some(flow) = flows.get(&peer).map(|f| f.clone()) {
            if let Err(e) = flow.send(data).await {
                debug!(%peer, error = %e, "webrtc upstream send failed");
            }
            continue;
        }

        match classify_udp_payload(data) {
            UdpPayloadKind::Stun => {
                let ufrag = match stun_username_ufrag(data) {
                    Ok(ufrag) => ufrag,
                    Err(e) => {
                        debug!(%peer, error = %e, "dropping stun without username");
                        continue;
                    }
                };
                match open_flow(&router, &tracker, &socket, &flows, peer, &ufrag).await {
                    Ok(flow) => {
                        if let Err(e) = flow.send(data).await {
                            debug!(%peer, error = %e, "webrtc upstream send failed");
                        }
                    }
                    Err(e) => warn!(%peer, %ufrag, error = %e, "webrtc flow setup failed"),
                }
            }
            UdpPayloadKind::RtpRtcp => {
                debug!(%peer, "dropping rtp/rtcp without session");
            }
            _ => {
                debug!(%peer, "dropping non-webrtc datagram");
            }
        }
    }
}

/// Resolve the session for `ufrag`, dial the backend, and remember the flow.
async fn open_flow(
    router: &StreamRouter,
    tracker: &SessionTracker,
    socket: &Arc<UdpSocket>,
    flows: &Arc<DashMap<SocketAddr, Arc<UdpSocket>>>,
    peer: SocketAddr,
    ufrag: &str,
) -> Result<Arc<UdpSocket>> {
    let session = tracker.webrtc_by_ufrag(ufrag).await?;
    let backend = router.route(&session.stream_url).await?;

    let upstream = Arc::new(
        UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| ProxyError::io("bind webrtc upstream", e))?,
    );
    upstream
        .connect((backend.ip.as_str(), backend.rtc_port()?))
        .await
        .map_err(|e| ProxyError::io("connect webrtc upstream", e))?;

    info!(%peer, ufrag, stream_url = %session.stream_url, backend = %backend.id(), "webrtc flow routed");
    flows.insert(peer, upstream.clone());

    // Pump backend replies to the peer until the flow idles out.
    let socket = socket.clone();
    let flows = flows.clone();
    let flow = upstream.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match tokio::time::timeout(SESSION_ALIVE_DURATION, flow.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    if let Err(e) = socket.send_to(&buf[..len], peer).await {
                        debug!(%peer, error = %e, "webrtc reply send failed");
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "webrtc upstream recv failed");
                    break;
                }
                Err(_) => {
                    debug!(%peer, "webrtc flow idle, closing");
                    break;
                }
            }
        }
        flows.remove(&peer);
    });

    Ok(upstream)
}
