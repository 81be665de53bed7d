//! Minimal AMF0 codec, enough to read RTMP command messages and synthesize
//! their replies.
//!
//! Only the value types that appear in `connect`/`createStream`/`publish`/
//! `play` conversations are supported.

use bytes::{BufMut, BytesMut};

use crate::error::{ProxyError, Result};

// AMF0 type markers.
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0C;

/// A decoded AMF0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
}

impl Amf0Value {
    /// String property of an object value.
    pub fn object_str(&self, key: &str) -> Option<&str> {
        match self {
            Amf0Value::Object(props) => props.iter().find_map(|(k, v)| match v {
                Amf0Value::String(s) if k == key => Some(s.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Decode every value in an AMF0 command payload.
pub fn decode_all(mut data: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while !data.is_empty() {
        values.push(decode_value(&mut data)?);
    }
    Ok(values)
}

fn decode_value(data: &mut &[u8]) -> Result<Amf0Value> {
    let marker = take(data, 1)?[0];
    match marker {
        MARKER_NUMBER => {
            let raw = take(data, 8)?;
            Ok(Amf0Value::Number(f64::from_be_bytes(raw.try_into().unwrap())))
        }
        MARKER_BOOLEAN => Ok(Amf0Value::Boolean(take(data, 1)?[0] != 0)),
        MARKER_STRING => {
            let len = u16::from_be_bytes(take(data, 2)?.try_into().unwrap()) as usize;
            Ok(Amf0Value::String(take_str(data, len)?))
        }
        MARKER_LONG_STRING => {
            let len = u32::from_be_bytes(take(data, 4)?.try_into().unwrap()) as usize;
            Ok(Amf0Value::String(take_str(data, len)?))
        }
        MARKER_OBJECT => decode_properties(data),
        MARKER_ECMA_ARRAY => {
            // The leading count is advisory; properties still end with the
            // object-end marker.
            take(data, 4)?;
            decode_properties(data)
        }
        MARKER_NULL => Ok(Amf0Value::Null),
        MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
        other => Err(ProxyError::Protocol(format!("unsupported amf0 marker 0x{other:02x}"))),
    }
}

fn decode_properties(data: &mut &[u8]) -> Result<Amf0Value> {
    let mut props = Vec::new();
    loop {
        let len = u16::from_be_bytes(take(data, 2)?.try_into().unwrap()) as usize;
        if len == 0 {
            let marker = take(data, 1)?[0];
            if marker != MARKER_OBJECT_END {
                return Err(ProxyError::Protocol(format!(
                    "bad amf0 object end 0x{marker:02x}"
                )));
            }
            return Ok(Amf0Value::Object(props));
        }
        let key = take_str(data, len)?;
        let value = decode_value(data)?;
        props.push((key, value));
    }
}

fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if data.len() < n {
        return Err(ProxyError::Protocol("truncated amf0 payload".into()));
    }
    let (head, rest) = data.split_at(n);
    *data = rest;
    Ok(head)
}

fn take_str(data: &mut &[u8], n: usize) -> Result<String> {
    let raw = take(data, n)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProxyError::Protocol("non-utf8 amf0 string".into()))
}

/// Encode values back-to-back into one AMF0 payload.
pub fn encode_all(values: &[Amf0Value]) -> BytesMut {
    let mut out = BytesMut::new();
    for value in values {
        encode_value(&mut out, value);
    }
    out
}

fn encode_value(out: &mut BytesMut, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            out.put_u8(MARKER_NUMBER);
            out.put_f64(*n);
        }
        Amf0Value::Boolean(b) => {
            out.put_u8(MARKER_BOOLEAN);
            out.put_u8(*b as u8);
        }
        Amf0Value::String(s) => {
            out.put_u8(MARKER_STRING);
            out.put_u16(s.len() as u16);
            out.put_slice(s.as_bytes());
        }
        Amf0Value::Object(props) => {
            out.put_u8(MARKER_OBJECT);
            for (key, value) in props {
                out.put_u16(key.len() as u16);
                out.put_slice(key.as_bytes());
                encode_value(out, value);
            }
            out.put_u16(0);
            out.put_u8(MARKER_OBJECT_END);
        }
        Amf0Value::Null => out.put_u8(MARKER_NULL),
        Amf0Value::Undefined => out.put_u8(MARKER_UNDEFINED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let values = vec![
            Amf0Value::String("connect".into()),
            Amf0Value::Number(1.0),
            Amf0Value::Object(vec![
                ("app".into(), Amf0Value::String("live".into())),
                ("tcUrl".into(), Amf0Value::String("rtmp://127.0.0.1:1935/live".into())),
                ("fpad".into(), Amf0Value::Boolean(false)),
            ]),
        ];

        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(decoded[2].object_str("tcUrl"), Some("rtmp://127.0.0.1:1935/live"));
    }

    #[test]
    fn null_and_publish_args() {
        let values = vec![
            Amf0Value::String("publish".into()),
            Amf0Value::Number(5.0),
            Amf0Value::Null,
            Amf0Value::String("livestream".into()),
            Amf0Value::String("live".into()),
        ];
        let decoded = decode_all(&encode_all(&values)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let encoded = encode_all(&[Amf0Value::String("connect".into())]);
        assert!(decode_all(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn unknown_marker_is_rejected() {
        assert!(decode_all(&[0x22, 0x00]).is_err());
    }
}
