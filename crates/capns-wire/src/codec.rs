//! Frame codec: a 32-bit big-endian length prefix followed by a CBOR map
//! with small-integer keys.
//!
//! The reader distinguishes a clean close (EOF on a frame boundary, surfaced
//! as `Ok(None)`) from a truncated frame (EOF mid-prefix or mid-body,
//! surfaced as [`WireError::Truncated`]). Both directions enforce the
//! negotiated `max_frame` before any body bytes move.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use ciborium::value::{Integer, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{FrameValidationError, LEGACY_RES_TYPE};
use crate::{Frame, FrameType, MessageId, PROTOCOL_VERSION};

/// Integer map keys of the frame encoding. Fixed assignment, additive only.
pub mod keys {
    pub const VERSION: u64 = 0;
    pub const FRAME_TYPE: u64 = 1;
    pub const ID: u64 = 2;
    pub const SEQ: u64 = 3;
    pub const CONTENT_TYPE: u64 = 4;
    pub const META: u64 = 5;
    pub const PAYLOAD: u64 = 6;
    pub const LEN: u64 = 7;
    pub const OFFSET: u64 = 8;
    pub const EOF: u64 = 9;
    pub const CAP: u64 = 10;
    pub const STREAM_ID: u64 = 11;
    pub const MEDIA_URN: u64 = 12;
    pub const ROUTING_ID: u64 = 13;
    pub const CHUNK_INDEX: u64 = 14;
    pub const CHUNK_COUNT: u64 = 15;
    pub const CHECKSUM: u64 = 16;
}

/// Size of the length prefix in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors from the frame codec.
///
/// Everything except `Io` casts doubt on transport integrity; callers are
/// expected to close the transport on any decode-class failure.
#[derive(Debug)]
pub enum WireError {
    Io(std::io::Error),
    /// Stream ended inside a length prefix or frame body.
    Truncated,
    /// Encoded frame exceeds the negotiated `max_frame`.
    FrameTooLarge { len: usize, max: usize },
    /// CBOR-level failure or a structurally impossible map.
    Decode(String),
    /// `version` byte this build does not speak.
    UnknownVersion(u8),
    /// Frame type value with no assignment.
    UnknownFrameType(u8),
    /// Frame type retired from the protocol (legacy "RES").
    ObsoleteFrameType(u8),
    /// Per-type required-field check failed.
    Invalid(FrameValidationError),
    /// The peer broke the handshake sequence.
    Handshake(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "i/o error: {e}"),
            WireError::Truncated => write!(f, "stream ended mid-frame"),
            WireError::FrameTooLarge { len, max } => {
                write!(f, "encoded frame is {len} bytes, limit {max}")
            }
            WireError::Decode(msg) => write!(f, "frame decode failed: {msg}"),
            WireError::UnknownVersion(v) => write!(f, "unknown protocol version {v}"),
            WireError::UnknownFrameType(t) => write!(f, "unknown frame type {t}"),
            WireError::ObsoleteFrameType(t) => write!(f, "obsolete frame type {t}"),
            WireError::Invalid(e) => write!(f, "invalid frame: {e}"),
            WireError::Handshake(msg) => write!(f, "handshake violation: {msg}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            WireError::Invalid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}

impl From<FrameValidationError> for WireError {
    fn from(e: FrameValidationError) -> Self {
        WireError::Invalid(e)
    }
}

fn key(k: u64) -> Value {
    Value::Integer(Integer::from(k))
}

/// Encode a frame to its full wire form (length prefix included),
/// enforcing `max_frame` on the body.
pub fn encode_frame(frame: &Frame, max_frame: u32) -> Result<Vec<u8>, WireError> {
    frame.validate()?;

    let mut entries: Vec<(Value, Value)> = Vec::with_capacity(8);
    entries.push((key(keys::VERSION), Value::Integer(PROTOCOL_VERSION.into())));
    entries.push((
        key(keys::FRAME_TYPE),
        Value::Integer(frame.frame_type.as_u8().into()),
    ));
    entries.push((key(keys::ID), Value::Bytes(frame.id.as_bytes().to_vec())));
    if let Some(seq) = frame.seq {
        entries.push((key(keys::SEQ), Value::Integer(seq.into())));
    }
    if let Some(content_type) = &frame.content_type {
        entries.push((key(keys::CONTENT_TYPE), Value::Text(content_type.clone())));
    }
    if let Some(meta) = &frame.meta {
        let pairs = meta
            .iter()
            .map(|(k, v)| (Value::Text(k.clone()), Value::Text(v.clone())))
            .collect();
        entries.push((key(keys::META), Value::Map(pairs)));
    }
    if let Some(payload) = &frame.payload {
        entries.push((key(keys::PAYLOAD), Value::Bytes(payload.to_vec())));
    }
    if let Some(len) = frame.len {
        entries.push((key(keys::LEN), Value::Integer(len.into())));
    }
    if let Some(offset) = frame.offset {
        entries.push((key(keys::OFFSET), Value::Integer(offset.into())));
    }
    if let Some(eof) = frame.eof {
        entries.push((key(keys::EOF), Value::Bool(eof)));
    }
    if let Some(cap) = &frame.cap {
        entries.push((key(keys::CAP), Value::Text(cap.clone())));
    }
    if let Some(stream_id) = &frame.stream_id {
        entries.push((key(keys::STREAM_ID), Value::Text(stream_id.clone())));
    }
    if let Some(media_urn) = &frame.media_urn {
        entries.push((key(keys::MEDIA_URN), Value::Text(media_urn.clone())));
    }
    if let Some(routing_id) = &frame.routing_id {
        entries.push((key(keys::ROUTING_ID), Value::Text(routing_id.clone())));
    }
    if let Some(chunk_index) = frame.chunk_index {
        entries.push((key(keys::CHUNK_INDEX), Value::Integer(chunk_index.into())));
    }
    if let Some(chunk_count) = frame.chunk_count {
        entries.push((key(keys::CHUNK_COUNT), Value::Integer(chunk_count.into())));
    }
    if let Some(checksum) = frame.checksum {
        entries.push((key(keys::CHECKSUM), Value::Integer(checksum.into())));
    }

    let mut body = Vec::new();
    ciborium::ser::into_writer(&Value::Map(entries), &mut body)
        .map_err(|e| WireError::Decode(format!("cbor encode: {e}")))?;

    if body.len() > max_frame as usize {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: max_frame as usize,
        });
    }

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn expect_u64(value: &Value, what: &str) -> Result<u64, WireError> {
    match value {
        Value::Integer(i) => {
            u64::try_from(*i).map_err(|_| WireError::Decode(format!("{what}: out of range")))
        }
        _ => Err(WireError::Decode(format!("{what}: expected integer"))),
    }
}

fn expect_text(value: &Value, what: &str) -> Result<String, WireError> {
    match value {
        Value::Text(s) => Ok(s.clone()),
        _ => Err(WireError::Decode(format!("{what}: expected text"))),
    }
}

fn expect_bytes(value: &Value, what: &str) -> Result<Bytes, WireError> {
    match value {
        Value::Bytes(b) => Ok(Bytes::from(b.clone())),
        _ => Err(WireError::Decode(format!("{what}: expected bytes"))),
    }
}

fn expect_bool(value: &Value, what: &str) -> Result<bool, WireError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(WireError::Decode(format!("{what}: expected bool"))),
    }
}

fn expect_meta(value: &Value) -> Result<BTreeMap<String, String>, WireError> {
    let Value::Map(pairs) = value else {
        return Err(WireError::Decode("meta: expected map".to_string()));
    };
    let mut meta = BTreeMap::new();
    for (k, v) in pairs {
        meta.insert(expect_text(k, "meta key")?, expect_text(v, "meta value")?);
    }
    Ok(meta)
}

/// Message ids arrive as 16 raw bytes or as a compact unsigned integer.
fn decode_id(value: &Value) -> Result<MessageId, WireError> {
    match value {
        Value::Bytes(b) => {
            let bytes: [u8; 16] = b
                .as_slice()
                .try_into()
                .map_err(|_| WireError::Decode(format!("id: expected 16 bytes, got {}", b.len())))?;
            Ok(MessageId::from_bytes(bytes))
        }
        Value::Integer(_) => Ok(MessageId::from_u64(expect_u64(value, "id")?)),
        _ => Err(WireError::Decode("id: expected bytes or integer".to_string())),
    }
}

/// Decode a frame body (the bytes after the length prefix). Fails hard on
/// unknown versions, the obsolete legacy type, and missing required fields.
pub fn decode_frame(body: &[u8]) -> Result<Frame, WireError> {
    let value: Value = ciborium::de::from_reader(body)
        .map_err(|e| WireError::Decode(format!("cbor decode: {e}")))?;
    let Value::Map(entries) = value else {
        return Err(WireError::Decode("frame is not a map".to_string()));
    };

    let mut version = None;
    let mut frame_type_raw = None;
    let mut id = None;
    let mut seq = None;
    let mut content_type = None;
    let mut meta = None;
    let mut payload = None;
    let mut len = None;
    let mut offset = None;
    let mut eof = None;
    let mut cap = None;
    let mut stream_id = None;
    let mut media_urn = None;
    let mut routing_id = None;
    let mut chunk_index = None;
    let mut chunk_count = None;
    let mut checksum = None;

    for (k, v) in &entries {
        let k = expect_u64(k, "map key")?;
        match k {
            keys::VERSION => version = Some(expect_u64(v, "version")?),
            keys::FRAME_TYPE => frame_type_raw = Some(expect_u64(v, "frame_type")?),
            keys::ID => id = Some(decode_id(v)?),
            keys::SEQ => seq = Some(expect_u64(v, "seq")?),
            keys::CONTENT_TYPE => content_type = Some(expect_text(v, "content_type")?),
            keys::META => meta = Some(expect_meta(v)?),
            keys::PAYLOAD => payload = Some(expect_bytes(v, "payload")?),
            keys::LEN => len = Some(expect_u64(v, "len")?),
            keys::OFFSET => offset = Some(expect_u64(v, "offset")?),
            keys::EOF => eof = Some(expect_bool(v, "eof")?),
            keys::CAP => cap = Some(expect_text(v, "cap")?),
            keys::STREAM_ID => stream_id = Some(expect_text(v, "stream_id")?),
            keys::MEDIA_URN => media_urn = Some(expect_text(v, "media_urn")?),
            keys::ROUTING_ID => routing_id = Some(expect_text(v, "routing_id")?),
            keys::CHUNK_INDEX => chunk_index = Some(expect_u64(v, "chunk_index")?),
            keys::CHUNK_COUNT => chunk_count = Some(expect_u64(v, "chunk_count")?),
            keys::CHECKSUM => checksum = Some(expect_u64(v, "checksum")?),
            // unknown keys are future additions; skip them
            _ => {}
        }
    }

    let version = version.ok_or_else(|| WireError::Decode("missing version".to_string()))?;
    if version != PROTOCOL_VERSION as u64 {
        return Err(WireError::UnknownVersion(version.min(u8::MAX as u64) as u8));
    }
    let frame_type_raw =
        frame_type_raw.ok_or_else(|| WireError::Decode("missing frame_type".to_string()))?;
    let frame_type_raw = u8::try_from(frame_type_raw)
        .map_err(|_| WireError::Decode("frame_type out of range".to_string()))?;
    if frame_type_raw == LEGACY_RES_TYPE {
        return Err(WireError::ObsoleteFrameType(frame_type_raw));
    }
    let frame_type =
        FrameType::from_u8(frame_type_raw).ok_or(WireError::UnknownFrameType(frame_type_raw))?;
    let id = id.ok_or_else(|| WireError::Decode("missing id".to_string()))?;

    let frame = Frame {
        frame_type,
        id,
        seq,
        content_type,
        meta,
        payload,
        len,
        offset,
        eof,
        cap,
        stream_id,
        media_urn,
        routing_id,
        chunk_index,
        chunk_count,
        checksum,
    };
    frame.validate()?;
    Ok(frame)
}

/// Read one frame. `Ok(None)` is a clean close: EOF landed exactly on a
/// frame boundary. EOF anywhere else is [`WireError::Truncated`].
pub async fn read_frame<R>(reader: &mut R, max_frame: u32) -> Result<Option<Frame>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::Truncated);
        }
        filled += n;
    }

    let body_len = u32::from_be_bytes(prefix) as usize;
    if body_len == 0 {
        return Err(WireError::Decode("zero-length frame".to_string()));
    }
    if body_len > max_frame as usize {
        return Err(WireError::FrameTooLarge {
            len: body_len,
            max: max_frame as usize,
        });
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })?;

    decode_frame(&body).map(Some)
}

/// Encode and write one frame, then flush. The flush keeps latency flat for
/// the many small control frames this protocol sends.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_frame: u32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(frame, max_frame)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
