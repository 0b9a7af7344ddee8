use std::collections::BTreeMap;
use std::fmt;

/// Connection limits exchanged during the handshake.
///
/// `max_frame` caps the encoded frame body (the value of the length
/// prefix); `max_chunk` caps a single CHUNK payload. Effective limits are
/// the component-wise minimum of the two proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum encoded frame size in bytes.
    pub max_frame: u32,
    /// Maximum CHUNK payload size in bytes.
    pub max_chunk: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame: 1024 * 1024,
            max_chunk: 64 * 1024,
        }
    }
}

impl Limits {
    pub fn new(max_frame: u32, max_chunk: u32) -> Self {
        Self {
            max_frame,
            max_chunk,
        }
    }

    /// Pairwise minimum of both proposals.
    pub fn negotiate(&self, other: &Limits) -> Limits {
        Limits {
            max_frame: self.max_frame.min(other.max_frame),
            max_chunk: self.max_chunk.min(other.max_chunk),
        }
    }

    /// Render into a frame `meta` map (HELLO, RELAY_NOTIFY).
    pub fn to_meta(&self, meta: &mut BTreeMap<String, String>) {
        meta.insert("max_frame".to_string(), self.max_frame.to_string());
        meta.insert("max_chunk".to_string(), self.max_chunk.to_string());
    }

    /// Parse from a frame `meta` map. `None` when either key is missing or
    /// not a decimal integer.
    pub fn from_meta(meta: &BTreeMap<String, String>) -> Option<Limits> {
        let max_frame = meta.get("max_frame")?.parse().ok()?;
        let max_chunk = meta.get("max_chunk")?.parse().ok()?;
        Some(Limits {
            max_frame,
            max_chunk,
        })
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_frame={} max_chunk={}",
            self.max_frame, self.max_chunk
        )
    }
}
