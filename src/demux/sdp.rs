//! ICE credential extraction from SDP.

use crate::error::{ProxyError, Result};

/// Extract `ice-ufrag` and `ice-pwd` from an SDP blob.
///
/// Returns the first `a=ice-ufrag:` / `a=ice-pwd:` attribute values; both
/// must be present.
pub fn parse_ice_ufrag_pwd(sdp: &str) -> Result<(String, String)> {
    let ufrag = attribute_value(sdp, "a=ice-ufrag:")
        .ok_or_else(|| ProxyError::Protocol("no ice-ufrag in sdp".into()))?;
    let pwd = attribute_value(sdp, "a=ice-pwd:")
        .ok_or_else(|| ProxyError::Protocol("no ice-pwd in sdp".into()))?;
    Ok((ufrag, pwd))
}

fn attribute_value(sdp: &str, prefix: &str) -> Option<String> {
    sdp.lines().find_map(|line| {
        let value = line.trim().strip_prefix(prefix)?;
        let value = value.split_whitespace().next()?;
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:Dq2X\r\n\
        a=ice-pwd:t9xNz0aInG7kqLhc3PxStGUx\r\n\
        a=mid:0\r\n";

    #[test]
    fn extracts_both_credentials() {
        let (ufrag, pwd) = parse_ice_ufrag_pwd(SDP).unwrap();
        assert_eq!(ufrag, "Dq2X");
        assert_eq!(pwd, "t9xNz0aInG7kqLhc3PxStGUx");
    }

    #[test]
    fn missing_credential_is_protocol_error() {
        assert!(matches!(
            parse_ice_ufrag_pwd("v=0\r\na=ice-ufrag:abc\r\n"),
            Err(ProxyError::Protocol(_))
        ));
        assert!(parse_ice_ufrag_pwd("v=0\r\n").is_err());
    }
}
