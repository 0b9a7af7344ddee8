//! Typed views over raw response bytes.
//!
//! Peers exchange bytes; [`ResponseValue`] pairs them with their declared
//! media kind and offers coercions to the common typed views a caller
//! actually wants.

use std::fmt;

use bytes::Bytes;

use crate::MediaKind;

/// Coercion failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapError {
    NotUtf8,
    NotInteger(String),
    NotNumber(String),
    NotBoolean(String),
    NotJson(String),
}

impl fmt::Display for WrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrapError::NotUtf8 => write!(f, "value is not valid UTF-8"),
            WrapError::NotInteger(s) => write!(f, "value {s:?} is not an integer"),
            WrapError::NotNumber(s) => write!(f, "value {s:?} is not a number"),
            WrapError::NotBoolean(s) => write!(f, "value {s:?} is not a boolean"),
            WrapError::NotJson(msg) => write!(f, "value is not JSON: {msg}"),
        }
    }
}

impl std::error::Error for WrapError {}

/// Raw bytes plus the media kind they were declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseValue {
    bytes: Bytes,
    kind: MediaKind,
}

impl ResponseValue {
    pub fn new(bytes: Bytes, kind: MediaKind) -> Self {
        ResponseValue { bytes, kind }
    }

    pub fn kind(&self) -> &MediaKind {
        &self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn as_text(&self) -> Result<&str, WrapError> {
        std::str::from_utf8(&self.bytes).map_err(|_| WrapError::NotUtf8)
    }

    pub fn as_i64(&self) -> Result<i64, WrapError> {
        let text = self.as_text()?.trim();
        text.parse()
            .map_err(|_| WrapError::NotInteger(text.to_string()))
    }

    pub fn as_f64(&self) -> Result<f64, WrapError> {
        let text = self.as_text()?.trim();
        text.parse()
            .map_err(|_| WrapError::NotNumber(text.to_string()))
    }

    pub fn as_bool(&self) -> Result<bool, WrapError> {
        match self.as_text()?.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(WrapError::NotBoolean(other.to_string())),
        }
    }

    pub fn as_json(&self) -> Result<serde_json::Value, WrapError> {
        serde_json::from_slice(&self.bytes).map_err(|e| WrapError::NotJson(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(bytes: &'static [u8], kind: MediaKind) -> ResponseValue {
        ResponseValue::new(Bytes::from_static(bytes), kind)
    }

    #[test]
    fn text_view() {
        let v = value(b"hello", MediaKind::Text);
        assert_eq!(v.as_text().unwrap(), "hello");
        assert_eq!(
            value(&[0xFF, 0xFE], MediaKind::Binary).as_text(),
            Err(WrapError::NotUtf8)
        );
    }

    #[test]
    fn numeric_views() {
        assert_eq!(value(b"42", MediaKind::Integer).as_i64().unwrap(), 42);
        assert_eq!(value(b" -7 ", MediaKind::Integer).as_i64().unwrap(), -7);
        assert_eq!(value(b"2.5", MediaKind::Number).as_f64().unwrap(), 2.5);
        assert!(value(b"nope", MediaKind::Integer).as_i64().is_err());
    }

    #[test]
    fn boolean_view() {
        assert!(value(b"true", MediaKind::Boolean).as_bool().unwrap());
        assert!(!value(b"false", MediaKind::Boolean).as_bool().unwrap());
        assert!(value(b"yes", MediaKind::Boolean).as_bool().is_err());
    }

    #[test]
    fn json_view() {
        let v = value(b"{\"a\":1}", MediaKind::Object);
        assert_eq!(v.as_json().unwrap()["a"], 1);
        assert!(value(b"{", MediaKind::Object).as_json().is_err());
    }

    #[test]
    fn binary_view_is_lossless() {
        let v = value(&[0, 159, 146, 150], MediaKind::Binary);
        assert_eq!(v.as_bytes(), &[0, 159, 146, 150]);
    }
}
