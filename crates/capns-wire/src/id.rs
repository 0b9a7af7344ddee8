use std::fmt;

use uuid::Uuid;

/// A 16-byte opaque message identifier.
///
/// An id namespaces a request: the REQ frame, every continuation
/// (STREAM_START / CHUNK / STREAM_END / LOG), and the terminal END or ERR
/// all carry the same id. Equality is by byte content; on the wire an id
/// may appear as 16 raw bytes (UUID form) or as a compact unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// A fresh random (UUID v4) id.
    pub fn random() -> Self {
        MessageId(*Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        MessageId(bytes)
    }

    /// Compact integer form: the value big-endian in the low 8 bytes.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&value.to_be_bytes());
        MessageId(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// If the id fits the compact integer form (upper 8 bytes zero),
    /// the integer value.
    pub fn as_u64(&self) -> Option<u64> {
        if self.0[..8].iter().all(|b| *b == 0) {
            Some(u64::from_be_bytes(self.0[8..].try_into().unwrap()))
        } else {
            None
        }
    }

    /// The canonical string form, used as the key of routing and
    /// pending-request tables.
    pub fn to_canonical(&self) -> String {
        Uuid::from_bytes(self.0).hyphenated().to_string()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        MessageId::from_u64(value)
    }
}
