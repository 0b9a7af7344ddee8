use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::{fnv1a_64, ErrorCode, Limits, MessageId};

/// The single supported protocol version byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Wire value of the removed legacy "RES" frame type. Rejected at decode.
pub(crate) const LEGACY_RES_TYPE: u8 = 2;

/// Frame type enumeration. Wire values are fixed and additive-only; value
/// `2` belonged to the removed "RES" type and must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake; payload is manifest bytes, meta carries proposed limits.
    Hello = 0,
    /// Liveness probe; echoed back with the same id.
    Heartbeat = 1,
    /// Invoke capability `cap`; payload must be empty, arguments follow as
    /// streams.
    Req = 3,
    /// Begin stream `stream_id` with a declared media URN.
    StreamStart = 4,
    /// A payload slice for `stream_id`, with index and FNV-1a checksum.
    Chunk = 5,
    /// Close `stream_id`; carries the total chunk count.
    StreamEnd = 6,
    /// Terminal frame for a message id.
    End = 7,
    /// Terminal error; meta carries `code` and `message`.
    Err = 8,
    /// Side-channel diagnostic; never affects stream state.
    Log = 9,
    /// Relay-to-relay: aggregated manifest and limits. Private to the pair.
    RelayNotify = 10,
    /// Relay-to-relay: opaque host-resource state. Private to the pair.
    RelayState = 11,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => FrameType::Hello,
            1 => FrameType::Heartbeat,
            3 => FrameType::Req,
            4 => FrameType::StreamStart,
            5 => FrameType::Chunk,
            6 => FrameType::StreamEnd,
            7 => FrameType::End,
            8 => FrameType::Err,
            9 => FrameType::Log,
            10 => FrameType::RelayNotify,
            11 => FrameType::RelayState,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for END and ERR, the two frames that terminate a message id.
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameType::End | FrameType::Err)
    }

    /// True for the two frames private to a relay pair.
    pub fn is_relay(self) -> bool {
        matches!(self, FrameType::RelayNotify | FrameType::RelayState)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Hello => "HELLO",
            FrameType::Heartbeat => "HEARTBEAT",
            FrameType::Req => "REQ",
            FrameType::StreamStart => "STREAM_START",
            FrameType::Chunk => "CHUNK",
            FrameType::StreamEnd => "STREAM_END",
            FrameType::End => "END",
            FrameType::Err => "ERR",
            FrameType::Log => "LOG",
            FrameType::RelayNotify => "RELAY_NOTIFY",
            FrameType::RelayState => "RELAY_STATE",
        };
        f.write_str(name)
    }
}

/// A decoded wire frame.
///
/// `frame_type` and `id` are always present; everything else is type
/// specific. Constructors fill the required fields for each type and
/// [`Frame::validate`] re-checks them (decode runs it on every inbound
/// frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: MessageId,
    /// Diagnostic send counter within a message id; never load-bearing.
    pub seq: Option<u64>,
    pub content_type: Option<String>,
    pub meta: Option<BTreeMap<String, String>>,
    pub payload: Option<Bytes>,
    pub len: Option<u64>,
    pub offset: Option<u64>,
    pub eof: Option<bool>,
    /// Capability URN in canonical form (REQ only).
    pub cap: Option<String>,
    pub stream_id: Option<String>,
    pub media_urn: Option<String>,
    pub routing_id: Option<String>,
    pub chunk_index: Option<u64>,
    pub chunk_count: Option<u64>,
    pub checksum: Option<u64>,
}

impl Frame {
    fn bare(frame_type: FrameType, id: MessageId) -> Self {
        Frame {
            frame_type,
            id,
            seq: None,
            content_type: None,
            meta: None,
            payload: None,
            len: None,
            offset: None,
            eof: None,
            cap: None,
            stream_id: None,
            media_urn: None,
            routing_id: None,
            chunk_index: None,
            chunk_count: None,
            checksum: None,
        }
    }

    pub fn hello(id: MessageId, manifest: Bytes, limits: Limits) -> Self {
        let mut frame = Frame::bare(FrameType::Hello, id);
        let mut meta = BTreeMap::new();
        limits.to_meta(&mut meta);
        frame.meta = Some(meta);
        frame.payload = Some(manifest);
        frame
    }

    pub fn heartbeat(id: MessageId) -> Self {
        Frame::bare(FrameType::Heartbeat, id)
    }

    pub fn req(id: MessageId, cap: impl Into<String>) -> Self {
        let mut frame = Frame::bare(FrameType::Req, id);
        frame.cap = Some(cap.into());
        frame
    }

    pub fn stream_start(
        id: MessageId,
        stream_id: impl Into<String>,
        media_urn: impl Into<String>,
    ) -> Self {
        let mut frame = Frame::bare(FrameType::StreamStart, id);
        frame.stream_id = Some(stream_id.into());
        frame.media_urn = Some(media_urn.into());
        frame
    }

    /// CHUNK with the checksum computed from the payload.
    pub fn chunk(
        id: MessageId,
        stream_id: impl Into<String>,
        chunk_index: u64,
        payload: Bytes,
    ) -> Self {
        let mut frame = Frame::bare(FrameType::Chunk, id);
        frame.stream_id = Some(stream_id.into());
        frame.chunk_index = Some(chunk_index);
        frame.checksum = Some(fnv1a_64(&payload));
        frame.payload = Some(payload);
        frame
    }

    pub fn stream_end(id: MessageId, stream_id: impl Into<String>, chunk_count: u64) -> Self {
        let mut frame = Frame::bare(FrameType::StreamEnd, id);
        frame.stream_id = Some(stream_id.into());
        frame.chunk_count = Some(chunk_count);
        frame
    }

    pub fn end(id: MessageId) -> Self {
        Frame::bare(FrameType::End, id)
    }

    pub fn err(id: MessageId, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut frame = Frame::bare(FrameType::Err, id);
        let mut meta = BTreeMap::new();
        meta.insert("code".to_string(), code.as_str().to_string());
        meta.insert("message".to_string(), message.into());
        frame.meta = Some(meta);
        frame
    }

    pub fn log(id: MessageId, level: impl Into<String>, message: impl Into<String>) -> Self {
        let mut frame = Frame::bare(FrameType::Log, id);
        let mut meta = BTreeMap::new();
        meta.insert("level".to_string(), level.into());
        meta.insert("message".to_string(), message.into());
        frame.meta = Some(meta);
        frame
    }

    pub fn relay_notify(id: MessageId, manifest_json: impl Into<String>, limits: Limits) -> Self {
        let mut frame = Frame::bare(FrameType::RelayNotify, id);
        let mut meta = BTreeMap::new();
        meta.insert("manifest".to_string(), manifest_json.into());
        limits.to_meta(&mut meta);
        frame.meta = Some(meta);
        frame
    }

    pub fn relay_state(id: MessageId, state: Bytes) -> Self {
        let mut frame = Frame::bare(FrameType::RelayState, id);
        frame.payload = Some(state);
        frame
    }

    /// REQ frames must carry their arguments as streams, never inline.
    /// True when this REQ smuggles payload bytes.
    pub fn has_forbidden_payload(&self) -> bool {
        self.frame_type == FrameType::Req
            && self.payload.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// The error code of an ERR frame, if well-formed.
    pub fn err_code(&self) -> Option<ErrorCode> {
        let meta = self.meta.as_ref()?;
        Some(ErrorCode::parse(meta.get("code")?))
    }

    /// The `message` meta entry (ERR and LOG frames).
    pub fn err_message(&self) -> Option<&str> {
        self.meta.as_ref()?.get("message").map(String::as_str)
    }

    fn meta_has(&self, key: &str) -> bool {
        self.meta.as_ref().is_some_and(|m| m.contains_key(key))
    }

    /// Enforce the per-type required-field table. Decoders fail hard on a
    /// frame that does not validate.
    pub fn validate(&self) -> Result<(), FrameValidationError> {
        let missing = |detail: &'static str| FrameValidationError {
            frame_type: self.frame_type,
            detail,
        };
        match self.frame_type {
            FrameType::Hello => {
                if self.meta.is_none() {
                    return Err(missing("missing meta"));
                }
                if !self.meta_has("max_frame") || !self.meta_has("max_chunk") {
                    return Err(missing("missing meta.max_frame/max_chunk"));
                }
            }
            FrameType::Req => {
                // a non-empty payload on REQ is a request-level protocol
                // error (ERR PROTOCOL_ERROR), not a decode failure; see
                // `has_forbidden_payload`
                if self.cap.is_none() {
                    return Err(missing("missing cap"));
                }
            }
            FrameType::StreamStart => {
                if self.stream_id.is_none() {
                    return Err(missing("missing stream_id"));
                }
                if self.media_urn.is_none() {
                    return Err(missing("missing media_urn"));
                }
            }
            FrameType::Chunk => {
                if self.stream_id.is_none() {
                    return Err(missing("missing stream_id"));
                }
                if self.chunk_index.is_none() {
                    return Err(missing("missing chunk_index"));
                }
                if self.checksum.is_none() {
                    return Err(missing("missing checksum"));
                }
                if self.payload.is_none() {
                    return Err(missing("missing payload"));
                }
            }
            FrameType::StreamEnd => {
                if self.stream_id.is_none() {
                    return Err(missing("missing stream_id"));
                }
                if self.chunk_count.is_none() {
                    return Err(missing("missing chunk_count"));
                }
            }
            FrameType::Err => {
                if !self.meta_has("code") {
                    return Err(missing("missing meta.code"));
                }
                if !self.meta_has("message") {
                    return Err(missing("missing meta.message"));
                }
            }
            FrameType::RelayNotify => {
                if !self.meta_has("manifest") {
                    return Err(missing("missing meta.manifest"));
                }
                if !self.meta_has("max_frame") || !self.meta_has("max_chunk") {
                    return Err(missing("missing meta.max_frame/max_chunk"));
                }
            }
            FrameType::Heartbeat | FrameType::End | FrameType::Log | FrameType::RelayState => {}
        }
        Ok(())
    }
}

/// A frame failed its per-type required-field check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameValidationError {
    pub frame_type: FrameType,
    pub detail: &'static str,
}

impl fmt::Display for FrameValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} frame: {}", self.frame_type, self.detail)
    }
}

impl std::error::Error for FrameValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_roundtrip() {
        for t in [
            FrameType::Hello,
            FrameType::Heartbeat,
            FrameType::Req,
            FrameType::StreamStart,
            FrameType::Chunk,
            FrameType::StreamEnd,
            FrameType::End,
            FrameType::Err,
            FrameType::Log,
            FrameType::RelayNotify,
            FrameType::RelayState,
        ] {
            assert_eq!(FrameType::from_u8(t.as_u8()), Some(t));
        }
        // the retired RES slot stays unassigned
        assert_eq!(FrameType::from_u8(LEGACY_RES_TYPE), None);
        assert_eq!(FrameType::from_u8(200), None);
    }

    #[test]
    fn constructors_validate() {
        let id = MessageId::from_u64(1);
        Frame::hello(id, Bytes::new(), Limits::default()).validate().unwrap();
        Frame::heartbeat(id).validate().unwrap();
        Frame::req(id, "cap:op=x").validate().unwrap();
        Frame::stream_start(id, "a", "media:binary").validate().unwrap();
        Frame::chunk(id, "a", 0, Bytes::from_static(b"x")).validate().unwrap();
        Frame::stream_end(id, "a", 1).validate().unwrap();
        Frame::end(id).validate().unwrap();
        Frame::err(id, ErrorCode::NoHandler, "nope").validate().unwrap();
        Frame::log(id, "info", "hi").validate().unwrap();
        Frame::relay_notify(id, "{}", Limits::default()).validate().unwrap();
        Frame::relay_state(id, Bytes::from_static(b"s")).validate().unwrap();
    }

    #[test]
    fn req_forbidden_payload_detection() {
        let id = MessageId::from_u64(1);
        let mut frame = Frame::req(id, "cap:op=x");
        assert!(!frame.has_forbidden_payload());
        frame.payload = Some(Bytes::new());
        assert!(!frame.has_forbidden_payload());
        frame.payload = Some(Bytes::from_static(b"sneaky"));
        assert!(frame.has_forbidden_payload());
        // still decodes; the receiver answers with ERR instead
        frame.validate().unwrap();
    }

    #[test]
    fn chunk_requires_integrity_fields() {
        let id = MessageId::from_u64(1);
        let mut frame = Frame::chunk(id, "a", 0, Bytes::from_static(b"x"));
        frame.checksum = None;
        let err = frame.validate().unwrap_err();
        assert_eq!(err.detail, "missing checksum");
    }

    #[test]
    fn chunk_checksum_matches_payload() {
        let frame = Frame::chunk(MessageId::from_u64(1), "a", 0, Bytes::from_static(b"hello"));
        assert_eq!(frame.checksum, Some(fnv1a_64(b"hello")));
    }

    #[test]
    fn err_accessors() {
        let frame = Frame::err(MessageId::from_u64(1), ErrorCode::EndpointDied, "gone");
        assert_eq!(frame.err_code(), Some(ErrorCode::EndpointDied));
        assert_eq!(frame.err_message(), Some("gone"));
    }
}
