//! SRT forwarder: per-caller UDP relay.
//!
//! The proxy answers the caller's induction handshake itself so it can see
//! the conclusion handshake, whose stream-id extension names the stream.
//! Only then is a backend picked; the recorded induction is replayed to the
//! backend, the caller's conclusion is re-cookied with the backend's SYN
//! cookie, and from there on datagrams are relayed verbatim in both
//! directions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::SESSION_ALIVE_DURATION;
use crate::demux::{
    classify_udp_payload, parse_srt_stream_id, vhost_for_host, UdpPayloadKind, DEFAULT_VHOST,
};
use crate::error::{is_peer_closed, ProxyError, Result};
use crate::router::StreamRouter;

const MAX_DATAGRAM: usize = 2048;

/// Patience for the caller to complete its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-attempt patience for the backend's induction response.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);
const UPSTREAM_ATTEMPTS: usize = 3;

/// Handshake CIF offsets within the packet.
const OFF_VERSION: usize = 16;
const OFF_EXTENSION_FIELD: usize = 22;
const OFF_HANDSHAKE_TYPE: usize = 36;
const OFF_SOCKET_ID: usize = 40;
const OFF_SYN_COOKIE: usize = 44;
const OFF_EXTENSIONS: usize = 64;

const HS_INDUCTION: u32 = 1;
const HS_CONCLUSION: u32 = 0xFFFF_FFFF;

/// Magic advertised in the extension field of an induction response.
const SRT_MAGIC: u16 = 0x4A17;
/// Stream-id extension type in the conclusion handshake.
const EXT_STREAM_ID: u16 = 5;

/// Run the SRT UDP server until cancelled.
pub async fn run_srt_server(router: StreamRouter, port: u16, cancel: CancellationToken) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ProxyError::io("bind srt", e))?,
    );
    info!(port, "srt server listening");

    let peers: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => {
                received.map_err(|e| ProxyError::io("recv srt", e))?
            }
        };
        let data = buf[..len].to_vec();

        if let Some(tx) = peers.get(&peer).map(|t| t.clone()) {
            // Back-pressure drops the datagram; SRT retransmits.
            let _ = tx.try_send(data);
            continue;
        }

        if classify_udp_payload(&data) != UdpPayloadKind::SrtHandshake {
            debug!(%peer, "dropping srt datagram without session");
            continue;
        }

        let (tx, rx) = mpsc::channel(256);
        let _ = tx.try_send(data);
        peers.insert(peer, tx);

        let socket = socket.clone();
        let peers = peers.clone();
        let router = router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match srt_session(socket, peer, rx, router, cancel).await {
                Ok(()) => debug!(%peer, "srt session closed"),
                Err(ProxyError::Cancelled) => {}
                Err(ProxyError::Io { source, .. }) if is_peer_closed(&source) => {
                    debug!(%peer, "srt peer closed");
                }
                Err(e) => warn!(%peer, error = %e, "srt session failed"),
            }
            peers.remove(&peer);
        });
    }
}

async fn srt_session(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    router: StreamRouter,
    cancel: CancellationToken,
) -> Result<()> {
    // Serve the induction exchange ourselves; the stream-id only arrives
    // with the conclusion.
    let cookie: u32 = rand::rng().random();
    let mut induction: Option<Vec<u8>> = None;
    let conclusion = loop {
        let pkt = tokio::time::timeout(HANDSHAKE_TIMEOUT, rx.recv())
            .await
            .map_err(|_| ProxyError::Protocol("srt handshake timed out".into()))?
            .ok_or(ProxyError::Cancelled)?;
        if classify_udp_payload(&pkt) != UdpPayloadKind::SrtHandshake {
            continue;
        }
        match handshake_type(&pkt) {
            Some(HS_INDUCTION) => {
                let response = induction_response(&pkt, cookie)
                    .ok_or_else(|| ProxyError::Protocol("short srt induction".into()))?;
                socket
                    .send_to(&response, peer)
                    .await
                    .map_err(|e| ProxyError::io("send srt induction", e))?;
                induction = Some(pkt);
            }
            Some(HS_CONCLUSION) => break pkt,
            _ => {}
        }
    };
    let induction =
        induction.ok_or_else(|| ProxyError::Protocol("srt conclusion before induction".into()))?;

    // The conclusion names the stream; only now can a backend be picked.
    let sid = handshake_stream_id(&conclusion)
        .ok_or_else(|| ProxyError::Protocol("no stream id in srt handshake".into()))?;
    let parsed = parse_srt_stream_id(&sid)?;
    let vhost = parsed
        .host
        .as_deref()
        .map(vhost_for_host)
        .unwrap_or_else(|| DEFAULT_VHOST.to_string());
    let stream_url = format!("srt://{}/{}", vhost, parsed.resource);
    let backend = router.route(&stream_url).await?;

    let upstream = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| ProxyError::io("bind srt upstream", e))?;
    upstream
        .connect((backend.ip.as_str(), backend.srt_port()?))
        .await
        .map_err(|e| ProxyError::io("connect srt upstream", e))?;

    // Redo the induction with the backend to learn its SYN cookie, then
    // forward the caller's conclusion under that cookie.
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let backend_cookie = {
        let mut found = None;
        for _ in 0..UPSTREAM_ATTEMPTS {
            upstream
                .send(&induction)
                .await
                .map_err(|e| ProxyError::io("send srt upstream induction", e))?;
            match tokio::time::timeout(UPSTREAM_TIMEOUT, upstream.recv(&mut buf)).await {
                Ok(Ok(len)) if handshake_type(&buf[..len]) == Some(HS_INDUCTION) => {
                    // Consumed, not forwarded: the caller already has our
                    // induction response.
                    found = syn_cookie(&buf[..len]);
                    break;
                }
                Ok(Ok(_)) | Err(_) => continue,
                Ok(Err(e)) => return Err(ProxyError::io("recv srt upstream", e)),
            }
        }
        found.ok_or_else(|| {
            ProxyError::BackendUnavailable(format!("srt backend {} not answering", backend.id()))
        })?
    };
    upstream
        .send(&recookied(&conclusion, backend_cookie))
        .await
        .map_err(|e| ProxyError::io("send srt conclusion", e))?;

    info!(%peer, %stream_url, backend = %backend.id(), "srt session routed");

    // Verbatim relay. Conclusion retransmits still carry our cookie and are
    // rewritten on the way through.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            pkt = rx.recv() => {
                let Some(pkt) = pkt else { return Ok(()) };
                let pkt = if handshake_type(&pkt) == Some(HS_CONCLUSION) {
                    recookied(&pkt, backend_cookie)
                } else {
                    pkt
                };
                upstream
                    .send(&pkt)
                    .await
                    .map_err(|e| ProxyError::io("send srt upstream", e))?;
            }
            received = tokio::time::timeout(SESSION_ALIVE_DURATION, upstream.recv(&mut buf)) => {
                match received {
                    Ok(Ok(len)) => {
                        socket
                            .send_to(&buf[..len], peer)
                            .await
                            .map_err(|e| ProxyError::io("send srt reply", e))?;
                    }
                    Ok(Err(e)) => return Err(ProxyError::io("recv srt upstream", e)),
                    Err(_) => {
                        debug!(%peer, "srt session idle, closing");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Handshake type of an SRT handshake packet.
fn handshake_type(data: &[u8]) -> Option<u32> {
    if classify_udp_payload(data) != UdpPayloadKind::SrtHandshake {
        return None;
    }
    field_u32(data, OFF_HANDSHAKE_TYPE)
}

fn syn_cookie(data: &[u8]) -> Option<u32> {
    field_u32(data, OFF_SYN_COOKIE)
}

fn field_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|raw| u32::from_be_bytes(raw.try_into().unwrap()))
}

/// Answer an induction request: version 5, the SRT magic in the extension
/// field, our SYN cookie, addressed to the caller's socket id.
fn induction_response(request: &[u8], cookie: u32) -> Option<Vec<u8>> {
    if request.len() < OFF_EXTENSIONS {
        return None;
    }
    let mut response = request[..OFF_EXTENSIONS].to_vec();
    let caller_socket_id = field_u32(request, OFF_SOCKET_ID)?;
    response[8..12].fill(0);
    response[12..16].copy_from_slice(&caller_socket_id.to_be_bytes());
    response[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&5u32.to_be_bytes());
    response[OFF_EXTENSION_FIELD..OFF_EXTENSION_FIELD + 2].copy_from_slice(&SRT_MAGIC.to_be_bytes());
    response[OFF_SYN_COOKIE..OFF_SYN_COOKIE + 4].copy_from_slice(&cookie.to_be_bytes());
    Some(response)
}

/// A copy of `packet` with the SYN cookie replaced.
fn recookied(packet: &[u8], cookie: u32) -> Vec<u8> {
    let mut out = packet.to_vec();
    if out.len() >= OFF_SYN_COOKIE + 4 {
        out[OFF_SYN_COOKIE..OFF_SYN_COOKIE + 4].copy_from_slice(&cookie.to_be_bytes());
    }
    out
}

/// Stream-id extension of a conclusion handshake, if any.
///
/// The extension payload stores the string as 32-bit little-endian words;
/// each 4-byte group is reversed back and trailing padding stripped.
fn handshake_stream_id(data: &[u8]) -> Option<String> {
    let mut at = OFF_EXTENSIONS;
    while at + 4 <= data.len() {
        let ext_type = u16::from_be_bytes([data[at], data[at + 1]]);
        let len = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize * 4;
        at += 4;
        if at + len > data.len() {
            return None;
        }
        if ext_type == EXT_STREAM_ID {
            let mut bytes = Vec::with_capacity(len);
            for word in data[at..at + len].chunks(4) {
                bytes.extend(word.iter().rev());
            }
            while bytes.last() == Some(&0) {
                bytes.pop();
            }
            return String::from_utf8(bytes).ok();
        }
        at += len;
    }
    None
}
