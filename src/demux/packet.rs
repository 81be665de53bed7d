//! UDP payload steering and the packet-level key extractors.
//!
//! A single UDP port may carry WebRTC (STUN, then RTP/RTCP) or SRT traffic;
//! the first bytes of each datagram decide the path before anything is
//! forwarded.

use crate::error::{ProxyError, Result};

/// STUN attribute carrying `ufrag-of-receiver:ufrag-of-sender` (RFC 8445).
const STUN_ATTR_USERNAME: u16 = 0x0006;

/// Size of the STUN message header (RFC 5389 section 6).
const STUN_HEADER_SIZE: usize = 20;

/// First 32 bits of an SRT handshake control packet: control flag set,
/// control type 0 (handshake), subtype 0.
const SRT_HANDSHAKE_PREFIX: u32 = 0x8000_0000;

/// Classification of one UDP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpPayloadKind {
    /// STUN message; the USERNAME attribute carries the routing ufrag.
    Stun,
    /// RTP or RTCP of an established WebRTC session; dispatched by 5-tuple.
    RtpRtcp,
    /// SRT handshake control packet; may carry the stream-id extension.
    SrtHandshake,
    /// Anything else on the socket is SRT data, dispatched by socket id.
    SrtData,
}

/// Steer a datagram by its first bytes.
///
/// An SRT handshake packet leads with `0x80 00 00 00` and would also pass
/// the RTP version mask, so the exact handshake magic is matched first.
pub fn classify_udp_payload(data: &[u8]) -> UdpPayloadKind {
    if !data.is_empty() && (data[0] == 0x00 || data[0] == 0x01) {
        return UdpPayloadKind::Stun;
    }
    if data.len() >= 4 && u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == SRT_HANDSHAKE_PREFIX {
        return UdpPayloadKind::SrtHandshake;
    }
    if data.len() >= 12 && (data[0] & 0xC0) == 0x80 {
        return UdpPayloadKind::RtpRtcp;
    }
    UdpPayloadKind::SrtData
}

/// Extract the routing ufrag from a STUN message's USERNAME attribute.
///
/// The attribute value is `<receiver ufrag>:<sender ufrag>`; the receiver
/// side is the one negotiated with the backend, which keys the session.
pub fn stun_username_ufrag(data: &[u8]) -> Result<String> {
    if data.len() < STUN_HEADER_SIZE {
        return Err(ProxyError::Protocol("short STUN message".into()));
    }

    let message_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = data.len().min(STUN_HEADER_SIZE + message_len);

    let mut at = STUN_HEADER_SIZE;
    while at + 4 <= end {
        let attr_type = u16::from_be_bytes([data[at], data[at + 1]]);
        let attr_len = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
        at += 4;
        if at + attr_len > end {
            break;
        }
        if attr_type == STUN_ATTR_USERNAME {
            let username = std::str::from_utf8(&data[at..at + attr_len])
                .map_err(|_| ProxyError::Protocol("non-utf8 STUN USERNAME".into()))?;
            let ufrag = username.split(':').next().unwrap_or(username);
            return Ok(ufrag.to_string());
        }
        // Attributes are padded to 4-byte boundaries.
        at += (attr_len + 3) & !3;
    }

    Err(ProxyError::Protocol("no USERNAME in STUN message".into()))
}

/// SRT socket id of a data packet, from bytes 12..16.
pub fn srt_socket_id(data: &[u8]) -> Option<u32> {
    if data.len() >= 16 {
        Some(u32::from_be_bytes([data[12], data[13], data[14], data[15]]))
    } else {
        None
    }
}

/// Parsed SRT stream-id, from the access-control form
/// `#!::h=<host>,r=<resource>,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtStreamId {
    /// Optional vhost hint from `h=`.
    pub host: Option<String>,
    /// Stream resource from `r=`, e.g. `live/livestream`.
    pub resource: String,
}

/// Parse an SRT stream-id string. The `r=` key is mandatory.
pub fn parse_srt_stream_id(sid: &str) -> Result<SrtStreamId> {
    let body = sid.strip_prefix("#!::").unwrap_or(sid);

    let mut host = None;
    let mut resource = None;
    for part in body.split(',') {
        match part.split_once('=') {
            Some(("h", value)) if !value.is_empty() => host = Some(value.to_string()),
            Some(("r", value)) if !value.is_empty() => resource = Some(value.to_string()),
            _ => {}
        }
    }

    let resource = resource.ok_or_else(|| ProxyError::Protocol(format!("no resource in sid {sid}")))?;
    Ok(SrtStreamId { host, resource })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steering_by_first_bytes() {
        assert_eq!(classify_udp_payload(&[0x00, 0x01, 0, 0]), UdpPayloadKind::Stun);
        assert_eq!(classify_udp_payload(&[0x01; 20]), UdpPayloadKind::Stun);

        let rtp = [0x80u8; 12];
        assert_eq!(classify_udp_payload(&rtp), UdpPayloadKind::RtpRtcp);

        // A full-size handshake control packet passes the RTP version mask
        // too; the magic must win.
        let mut handshake = [0u8; 64];
        handshake[0] = 0x80;
        assert_eq!(classify_udp_payload(&handshake), UdpPayloadKind::SrtHandshake);
        assert_eq!(
            classify_udp_payload(&[0x80, 0x00, 0x00, 0x00, 0, 0, 0, 0]),
            UdpPayloadKind::SrtHandshake
        );

        // RTP check needs 12 bytes; a short 0x80-first packet is SRT.
        assert_eq!(classify_udp_payload(&[0x80, 0, 0, 1]), UdpPayloadKind::SrtData);
        assert_eq!(classify_udp_payload(&[0xFF, 1, 2, 3]), UdpPayloadKind::SrtData);
    }

    fn stun_with_username(username: &[u8]) -> Vec<u8> {
        let attr_len = username.len();
        let padded = (attr_len + 3) & !3;
        let mut msg = vec![0u8; STUN_HEADER_SIZE];
        msg[0] = 0x00;
        msg[1] = 0x01;
        let message_len = (4 + padded) as u16;
        msg[2..4].copy_from_slice(&message_len.to_be_bytes());
        msg.extend_from_slice(&STUN_ATTR_USERNAME.to_be_bytes());
        msg.extend_from_slice(&(attr_len as u16).to_be_bytes());
        msg.extend_from_slice(username);
        msg.resize(STUN_HEADER_SIZE + message_len as usize, 0);
        msg
    }

    #[test]
    fn stun_username_first_token() {
        let msg = stun_with_username(b"backendUfrag:clientUfrag");
        assert_eq!(stun_username_ufrag(&msg).unwrap(), "backendUfrag");

        let msg = stun_with_username(b"solo");
        assert_eq!(stun_username_ufrag(&msg).unwrap(), "solo");
    }

    #[test]
    fn stun_without_username_is_protocol_error() {
        let mut msg = vec![0u8; STUN_HEADER_SIZE];
        msg[1] = 0x01;
        assert!(matches!(stun_username_ufrag(&msg), Err(ProxyError::Protocol(_))));
        assert!(stun_username_ufrag(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn socket_id_from_data_packet() {
        let mut data = vec![0u8; 16];
        data[12..16].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        assert_eq!(srt_socket_id(&data), Some(0xDEADBEEF));
        assert_eq!(srt_socket_id(&data[..12]), None);
    }

    #[test]
    fn stream_id_with_host_and_resource() {
        let sid = parse_srt_stream_id("#!::h=example.com,r=live/livestream,m=request").unwrap();
        assert_eq!(sid.host.as_deref(), Some("example.com"));
        assert_eq!(sid.resource, "live/livestream");
    }

    #[test]
    fn stream_id_without_resource_is_rejected() {
        assert!(matches!(
            parse_srt_stream_id("#!::m=request"),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn stream_id_without_prefix() {
        let sid = parse_srt_stream_id("r=live/show").unwrap();
        assert_eq!(sid.host, None);
        assert_eq!(sid.resource, "live/show");
    }
}
