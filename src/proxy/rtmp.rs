//! RTMP forwarder.
//!
//! The proxy answers the client's handshake and just enough of the connect
//! conversation to learn the stream URL, then dials the routed backend,
//! replays the client's recorded bytes, and relays both directions:
//!
//! - client → backend is copied verbatim, since the backend sees exactly
//!   the chunk stream the client produced;
//! - backend → client is relayed message by message, re-framed with the
//!   proxy's own chunking, so the replies the proxy already gave (connect,
//!   createStream) can be suppressed instead of arriving twice.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::demux::rtmp_stream_url;
use crate::error::{is_peer_closed, ProxyError, Result};
use crate::router::StreamRouter;

use super::amf0::{self, Amf0Value};

const RTMP_VERSION: u8 = 3;
const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size clients start with, per the RTMP specification.
const DEFAULT_CHUNK_SIZE: usize = 128;
/// Chunk size the proxy announces for its own framing toward the client.
const OUT_CHUNK_SIZE: usize = 4096;
/// Upper bound on a single assembled message.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const MSG_SET_CHUNK_SIZE: u8 = 1;
const MSG_WINDOW_ACK_SIZE: u8 = 5;
const MSG_SET_PEER_BANDWIDTH: u8 = 6;
const MSG_COMMAND_AMF0: u8 = 20;

const WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Run the RTMP server until cancelled.
pub async fn run_rtmp_server(
    router: StreamRouter,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ProxyError::io("bind rtmp", e))?;
    info!(port, "rtmp server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "rtmp accept failed");
                        continue;
                    }
                };
                let router = router.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    match serve_connection(stream, peer, router, cancel).await {
                        Ok(()) => {}
                        Err(ProxyError::Io { source, .. }) if is_peer_closed(&source) => {
                            debug!(%peer, "rtmp peer closed");
                        }
                        Err(ProxyError::Cancelled) => {}
                        Err(e) => warn!(%peer, error = %e, "rtmp session failed"),
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    router: StreamRouter,
    cancel: CancellationToken,
) -> Result<()> {
    serve_handshake(&mut client).await?;

    // Sniff the connect conversation, recording every raw byte for replay.
    let mut reader = ChunkReader::with_recording();
    let mut tc_url: Option<String> = None;
    let mut announced = false;
    let stream_name = loop {
        let msg = reader.read_message(&mut client).await?;
        if msg.msg_type != MSG_COMMAND_AMF0 {
            continue;
        }
        let values = amf0::decode_all(&msg.payload)?;
        let Some(name) = values.first().and_then(Amf0Value::as_str) else {
            continue;
        };
        let transaction = values.get(1).and_then(Amf0Value::as_number).unwrap_or(0.0);
        match name {
            "connect" => {
                tc_url = values
                    .get(2)
                    .and_then(|v| v.object_str("tcUrl"))
                    .map(String::from);
                if tc_url.is_none() {
                    return Err(ProxyError::Protocol("connect without tcUrl".into()));
                }
                if !announced {
                    write_message(&mut client, OUT_CHUNK_SIZE, &control_message(
                        MSG_SET_CHUNK_SIZE,
                        &(OUT_CHUNK_SIZE as u32).to_be_bytes(),
                    ))
                    .await?;
                    write_message(&mut client, OUT_CHUNK_SIZE, &control_message(
                        MSG_WINDOW_ACK_SIZE,
                        &WINDOW_ACK_SIZE.to_be_bytes(),
                    ))
                    .await?;
                    let mut bandwidth = WINDOW_ACK_SIZE.to_be_bytes().to_vec();
                    bandwidth.push(2); // dynamic limit
                    write_message(&mut client, OUT_CHUNK_SIZE, &control_message(
                        MSG_SET_PEER_BANDWIDTH,
                        &bandwidth,
                    ))
                    .await?;
                    announced = true;
                }
                write_message(&mut client, OUT_CHUNK_SIZE, &connect_result(transaction)).await?;
            }
            "createStream" => {
                write_message(&mut client, OUT_CHUNK_SIZE, &command_message(&[
                    Amf0Value::String("_result".into()),
                    Amf0Value::Number(transaction),
                    Amf0Value::Null,
                    Amf0Value::Number(1.0),
                ]))
                .await?;
            }
            "publish" | "play" => {
                let name = values
                    .get(2..)
                    .unwrap_or_default()
                    .iter()
                    .find_map(Amf0Value::as_str)
                    .ok_or_else(|| ProxyError::Protocol("publish/play without stream name".into()))?;
                break name.to_string();
            }
            // releaseStream, FCPublish and friends need no reply to proceed.
            _ => {}
        }
    };

    let tc_url = tc_url.ok_or_else(|| ProxyError::Protocol("publish before connect".into()))?;
    let stream_url = rtmp_stream_url(&tc_url, &stream_name)?;
    let backend = router.route(&stream_url).await?;

    let addr = format!("{}:{}", backend.ip, backend.rtmp_port()?);
    let mut upstream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ProxyError::io("dial rtmp backend", e))?;
    dial_handshake(&mut upstream).await?;

    // The backend replays the client's exact chunk stream from the top.
    let recorded = reader.take_recorded();
    upstream
        .write_all(&recorded)
        .await
        .map_err(|e| ProxyError::io("replay to rtmp backend", e))?;

    info!(%peer, %stream_url, backend = %backend.id(), "rtmp session routed");
    relay(client, upstream, cancel).await
}

/// Answer the simple (non-digest) handshake as a server.
async fn serve_handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    stream
        .read_exact(&mut c0c1)
        .await
        .map_err(|e| ProxyError::io("read rtmp c0c1", e))?;
    if c0c1[0] != RTMP_VERSION {
        return Err(ProxyError::Protocol(format!("bad rtmp version {}", c0c1[0])));
    }

    let mut response = Vec::with_capacity(1 + 2 * HANDSHAKE_SIZE);
    response.push(RTMP_VERSION);
    response.extend_from_slice(&handshake_packet());
    response.extend_from_slice(&c0c1[1..]);
    stream
        .write_all(&response)
        .await
        .map_err(|e| ProxyError::io("write rtmp s0s1s2", e))?;

    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    stream
        .read_exact(&mut c2)
        .await
        .map_err(|e| ProxyError::io("read rtmp c2", e))?;
    Ok(())
}

/// Run the simple handshake as a client against a backend.
async fn dial_handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&handshake_packet());
    stream
        .write_all(&c0c1)
        .await
        .map_err(|e| ProxyError::io("write rtmp c0c1", e))?;

    let mut s0s1s2 = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
    stream
        .read_exact(&mut s0s1s2)
        .await
        .map_err(|e| ProxyError::io("read rtmp s0s1s2", e))?;
    if s0s1s2[0] != RTMP_VERSION {
        return Err(ProxyError::Protocol(format!("bad rtmp version {}", s0s1s2[0])));
    }

    // C2 echoes S1.
    stream
        .write_all(&s0s1s2[1..1 + HANDSHAKE_SIZE])
        .await
        .map_err(|e| ProxyError::io("write rtmp c2", e))?;
    Ok(())
}

/// Time, zero, and 1528 random bytes.
fn handshake_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    rand::rng().fill_bytes(&mut packet[8..]);
    packet
}

async fn relay(client: TcpStream, upstream: TcpStream, cancel: CancellationToken) -> Result<()> {
    let (mut client_rx, mut client_tx) = client.into_split();
    let (mut upstream_rx, mut upstream_tx) = upstream.into_split();

    let client_to_backend = async {
        tokio::io::copy(&mut client_rx, &mut upstream_tx)
            .await
            .map(|_| ())
            .map_err(|e| ProxyError::io("copy to rtmp backend", e))
    };

    let backend_to_client = async {
        let mut reader = ChunkReader::new();
        loop {
            let msg = reader.read_message(&mut upstream_rx).await?;
            match msg.msg_type {
                // Consumed by the reader; the proxy frames its own output.
                MSG_SET_CHUNK_SIZE => continue,
                // The proxy already answered connect and createStream.
                MSG_COMMAND_AMF0 if matches!(command_name(&msg.payload).as_deref(), Some("_result") | Some("_error")) => {
                    continue
                }
                _ => {}
            }
            write_message(&mut client_tx, OUT_CHUNK_SIZE, &msg).await?;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        result = client_to_backend => result,
        result = backend_to_client => result,
    }
}

fn command_name(payload: &[u8]) -> Option<String> {
    if payload.first() != Some(&0x02) || payload.len() < 3 {
        return None;
    }
    let len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    let raw = payload.get(3..3 + len)?;
    String::from_utf8(raw.to_vec()).ok()
}

fn connect_result(transaction: f64) -> RtmpMessage {
    command_message(&[
        Amf0Value::String("_result".into()),
        Amf0Value::Number(transaction),
        Amf0Value::Object(vec![
            ("fmsVer".into(), Amf0Value::String("FMS/3,5,3,888".into())),
            ("capabilities".into(), Amf0Value::Number(127.0)),
        ]),
        Amf0Value::Object(vec![
            ("level".into(), Amf0Value::String("status".into())),
            ("code".into(), Amf0Value::String("NetConnection.Connect.Success".into())),
            ("description".into(), Amf0Value::String("Connection succeeded".into())),
            ("objectEncoding".into(), Amf0Value::Number(0.0)),
        ]),
    ])
}

fn command_message(values: &[Amf0Value]) -> RtmpMessage {
    RtmpMessage {
        csid: 3,
        msg_type: MSG_COMMAND_AMF0,
        msg_stream_id: 0,
        timestamp: 0,
        payload: amf0::encode_all(values).freeze(),
    }
}

fn control_message(msg_type: u8, payload: &[u8]) -> RtmpMessage {
    RtmpMessage {
        csid: 2,
        msg_type,
        msg_stream_id: 0,
        timestamp: 0,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// One assembled RTMP message.
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpMessage {
    pub csid: u32,
    pub msg_type: u8,
    pub msg_stream_id: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[derive(Default)]
struct ChunkStreamState {
    timestamp: u32,
    delta: u32,
    msg_len: usize,
    msg_type: u8,
    msg_stream_id: u32,
    ext_ts: bool,
    assembled: Vec<u8>,
}

/// Incremental chunk-stream reader, assembling whole messages.
///
/// Applies inbound `SetChunkSize` messages itself and optionally records
/// every consumed byte for verbatim replay.
pub struct ChunkReader {
    chunk_size: usize,
    streams: HashMap<u32, ChunkStreamState>,
    record: Option<Vec<u8>>,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE, streams: HashMap::new(), record: None }
    }

    pub fn with_recording() -> Self {
        Self { record: Some(Vec::new()), ..Self::new() }
    }

    /// All bytes consumed so far, ending the recording.
    pub fn take_recorded(&mut self) -> Vec<u8> {
        self.record.take().unwrap_or_default()
    }

    async fn read_bytes<R: AsyncRead + Unpin>(&mut self, r: &mut R, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        r.read_exact(&mut buf)
            .await
            .map_err(|e| ProxyError::io("read rtmp chunk", e))?;
        if let Some(record) = &mut self.record {
            record.extend_from_slice(&buf);
        }
        Ok(buf)
    }

    /// Read chunks until one message completes.
    pub async fn read_message<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> Result<RtmpMessage> {
        loop {
            let basic = self.read_bytes(r, 1).await?[0];
            let fmt = basic >> 6;
            let csid = match basic & 0x3F {
                0 => 64 + self.read_bytes(r, 1).await?[0] as u32,
                1 => {
                    let ext = self.read_bytes(r, 2).await?;
                    64 + ext[0] as u32 + ext[1] as u32 * 256
                }
                id => id as u32,
            };

            let prev_ext_ts = self.streams.get(&csid).map(|s| s.ext_ts).unwrap_or(false);
            let header = match fmt {
                0 => self.read_bytes(r, 11).await?,
                1 => self.read_bytes(r, 7).await?,
                2 => self.read_bytes(r, 3).await?,
                _ => Vec::new(),
            };

            let ts_field = if fmt <= 2 { u24(&header[0..3]) } else { 0 };
            let ext_ts_present = if fmt <= 2 { ts_field == 0xFF_FFFF } else { prev_ext_ts };
            let ext_ts = if ext_ts_present {
                let raw = self.read_bytes(r, 4).await?;
                Some(u32::from_be_bytes(raw.try_into().unwrap()))
            } else {
                None
            };

            let state = self.streams.entry(csid).or_default();
            let starting = state.assembled.is_empty();
            match fmt {
                0 => {
                    state.msg_len = u24(&header[3..6]) as usize;
                    state.msg_type = header[6];
                    state.msg_stream_id =
                        u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
                    state.timestamp = ext_ts.unwrap_or(ts_field);
                    state.delta = 0;
                    state.ext_ts = ext_ts.is_some();
                }
                1 => {
                    state.msg_len = u24(&header[3..6]) as usize;
                    state.msg_type = header[6];
                    state.delta = ext_ts.unwrap_or(ts_field);
                    state.ext_ts = ext_ts.is_some();
                    if starting {
                        state.timestamp = state.timestamp.wrapping_add(state.delta);
                    }
                }
                2 => {
                    state.delta = ext_ts.unwrap_or(ts_field);
                    state.ext_ts = ext_ts.is_some();
                    if starting {
                        state.timestamp = state.timestamp.wrapping_add(state.delta);
                    }
                }
                _ => {
                    if starting {
                        state.timestamp = state.timestamp.wrapping_add(state.delta);
                    }
                }
            }

            if state.msg_len > MAX_MESSAGE_SIZE {
                return Err(ProxyError::Protocol(format!(
                    "rtmp message of {} bytes on csid {csid}",
                    state.msg_len
                )));
            }

            let to_read = self.chunk_size.min(state.msg_len - state.assembled.len());
            let chunk = self.read_bytes(r, to_read).await?;
            let state = self.streams.get_mut(&csid).expect("chunk stream state");
            state.assembled.extend_from_slice(&chunk);

            if state.assembled.len() == state.msg_len {
                let payload = Bytes::from(std::mem::take(&mut state.assembled));
                let msg = RtmpMessage {
                    csid,
                    msg_type: state.msg_type,
                    msg_stream_id: state.msg_stream_id,
                    timestamp: state.timestamp,
                    payload,
                };
                if msg.msg_type == MSG_SET_CHUNK_SIZE && msg.payload.len() >= 4 {
                    let size = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]) & 0x7FFF_FFFF;
                    if size == 0 || size as usize > MAX_MESSAGE_SIZE {
                        return Err(ProxyError::Protocol(format!("bad rtmp chunk size {size}")));
                    }
                    self.chunk_size = size as usize;
                }
                return Ok(msg);
            }
        }
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

fn u24(raw: &[u8]) -> u32 {
    (raw[0] as u32) << 16 | (raw[1] as u32) << 8 | raw[2] as u32
}

/// Write one message as fmt-0 plus continuation chunks.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    chunk_size: usize,
    msg: &RtmpMessage,
) -> Result<()> {
    let mut out = Vec::with_capacity(18 + msg.payload.len() + msg.payload.len() / chunk_size * 5);
    let ext = msg.timestamp >= 0xFF_FFFF;
    let ts_field = if ext { 0xFF_FFFF } else { msg.timestamp };

    put_basic_header(&mut out, 0, msg.csid);
    out.extend_from_slice(&ts_field.to_be_bytes()[1..]);
    out.extend_from_slice(&(msg.payload.len() as u32).to_be_bytes()[1..]);
    out.push(msg.msg_type);
    out.extend_from_slice(&msg.msg_stream_id.to_le_bytes());
    if ext {
        out.extend_from_slice(&msg.timestamp.to_be_bytes());
    }

    let mut chunks = msg.payload.chunks(chunk_size);
    if let Some(first) = chunks.next() {
        out.extend_from_slice(first);
    }
    for chunk in chunks {
        put_basic_header(&mut out, 3, msg.csid);
        if ext {
            out.extend_from_slice(&msg.timestamp.to_be_bytes());
        }
        out.extend_from_slice(chunk);
    }

    w.write_all(&out)
        .await
        .map_err(|e| ProxyError::io("write rtmp message", e))
}

fn put_basic_header(out: &mut Vec<u8>, fmt: u8, csid: u32) {
    match csid {
        2..=63 => out.push(fmt << 6 | csid as u8),
        64..=319 => {
            out.push(fmt << 6);
            out.push((csid - 64) as u8);
        }
        _ => {
            out.push(fmt << 6 | 1);
            let id = csid - 64;
            out.push((id & 0xFF) as u8);
            out.push((id >> 8) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(msg: RtmpMessage, chunk_size: usize) -> RtmpMessage {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        write_message(&mut tx, chunk_size, &msg).await.unwrap();
        let mut reader = ChunkReader::new();
        reader.chunk_size = chunk_size;
        reader.read_message(&mut rx).await.unwrap()
    }

    #[tokio::test]
    async fn single_chunk_message_round_trips() {
        let msg = command_message(&[
            Amf0Value::String("connect".into()),
            Amf0Value::Number(1.0),
            Amf0Value::Object(vec![(
                "tcUrl".into(),
                Amf0Value::String("rtmp://127.0.0.1/live".into()),
            )]),
        ]);
        assert_eq!(round_trip(msg.clone(), 4096).await, msg);
    }

    #[tokio::test]
    async fn multi_chunk_message_round_trips() {
        let msg = RtmpMessage {
            csid: 7,
            msg_type: 9,
            msg_stream_id: 1,
            timestamp: 42,
            payload: Bytes::from(vec![0xAB; 1000]),
        };
        let got = round_trip(msg.clone(), 128).await;
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn extended_timestamp_round_trips() {
        let msg = RtmpMessage {
            csid: 4,
            msg_type: 8,
            msg_stream_id: 1,
            timestamp: 0x0100_0000,
            payload: Bytes::from(vec![1, 2, 3]),
        };
        assert_eq!(round_trip(msg.clone(), 4096).await, msg);
    }

    #[tokio::test]
    async fn large_csid_round_trips() {
        let msg = RtmpMessage {
            csid: 200,
            msg_type: 9,
            msg_stream_id: 1,
            timestamp: 0,
            payload: Bytes::from(vec![9; 10]),
        };
        assert_eq!(round_trip(msg.clone(), 4096).await, msg);
    }

    #[tokio::test]
    async fn inbound_set_chunk_size_is_applied() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let resize = control_message(MSG_SET_CHUNK_SIZE, &4096u32.to_be_bytes());
        write_message(&mut tx, DEFAULT_CHUNK_SIZE, &resize).await.unwrap();

        let big = RtmpMessage {
            csid: 5,
            msg_type: 9,
            msg_stream_id: 1,
            timestamp: 0,
            payload: Bytes::from(vec![3; 2000]),
        };
        write_message(&mut tx, 4096, &big).await.unwrap();

        let mut reader = ChunkReader::new();
        assert_eq!(reader.read_message(&mut rx).await.unwrap().msg_type, MSG_SET_CHUNK_SIZE);
        assert_eq!(reader.read_message(&mut rx).await.unwrap(), big);
    }

    #[tokio::test]
    async fn recording_captures_consumed_bytes() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let msg = command_message(&[Amf0Value::String("createStream".into()), Amf0Value::Number(2.0)]);
        write_message(&mut tx, DEFAULT_CHUNK_SIZE, &msg).await.unwrap();

        let mut reader = ChunkReader::with_recording();
        reader.read_message(&mut rx).await.unwrap();
        let recorded = reader.take_recorded();

        // Replaying the recorded bytes parses to the same message.
        let (mut tx2, mut rx2) = tokio::io::duplex(64 * 1024);
        tx2.write_all(&recorded).await.unwrap();
        let mut reader2 = ChunkReader::new();
        assert_eq!(reader2.read_message(&mut rx2).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn handshake_pair() {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);
        let server_side = tokio::spawn(async move {
            serve_handshake(&mut server).await.unwrap();
            server
        });
        dial_handshake(&mut client).await.unwrap();
        server_side.await.unwrap();
    }

    #[test]
    fn command_name_peek() {
        let payload = amf0::encode_all(&[Amf0Value::String("_result".into()), Amf0Value::Number(1.0)]);
        assert_eq!(command_name(&payload).as_deref(), Some("_result"));
        assert_eq!(command_name(&[0x00, 0x01]), None);
    }
}
