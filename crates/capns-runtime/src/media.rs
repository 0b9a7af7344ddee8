//! Media-URN resolution for the built-in value kinds.
//!
//! Built-in URNs (`media:void`, `media:string`, `media:integer`,
//! `media:number`, `media:boolean`, `media:object`, `media:binary`, and
//! `media:array;of=<kind>`) always resolve. Anything else is left to an
//! external resolver table.

use std::collections::BTreeMap;
use std::fmt;

use capns_urn::{CapUrn, TagValue};

/// The value kind a media URN names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Void,
    Text,
    Integer,
    Number,
    Boolean,
    Object,
    Binary,
    Array(Box<MediaKind>),
}

impl MediaKind {
    /// The IANA-ish media type used for transport hints.
    pub fn media_type(&self) -> &'static str {
        match self {
            MediaKind::Void => "application/x-empty",
            MediaKind::Text => "text/plain; charset=utf-8",
            MediaKind::Integer | MediaKind::Number | MediaKind::Boolean => "application/json",
            MediaKind::Object | MediaKind::Array(_) => "application/json",
            MediaKind::Binary => "application/octet-stream",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Void => write!(f, "void"),
            MediaKind::Text => write!(f, "string"),
            MediaKind::Integer => write!(f, "integer"),
            MediaKind::Number => write!(f, "number"),
            MediaKind::Boolean => write!(f, "boolean"),
            MediaKind::Object => write!(f, "object"),
            MediaKind::Binary => write!(f, "binary"),
            MediaKind::Array(inner) => write!(f, "array of {inner}"),
        }
    }
}

/// What a resolved media URN offers its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub media_type: String,
    pub profile_uri: Option<String>,
    /// JSON schema, for kinds that carry one. Built-ins carry none.
    pub schema: Option<String>,
    pub validation: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Resolution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaResolveError {
    /// The URN is not in the `media:` scheme.
    NotMediaScheme(String),
    /// No built-in kind matches and no external table is consulted here.
    UnknownMedia(String),
}

impl fmt::Display for MediaResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaResolveError::NotMediaScheme(urn) => {
                write!(f, "{urn:?} is not a media URN")
            }
            MediaResolveError::UnknownMedia(urn) => {
                write!(f, "no resolution for media URN {urn:?}")
            }
        }
    }
}

impl std::error::Error for MediaResolveError {}

const SCALAR_KINDS: [(&str, MediaKind); 7] = [
    ("void", MediaKind::Void),
    ("string", MediaKind::Text),
    ("integer", MediaKind::Integer),
    ("number", MediaKind::Number),
    ("boolean", MediaKind::Boolean),
    ("object", MediaKind::Object),
    ("binary", MediaKind::Binary),
];

/// Determine the built-in kind a media URN names.
pub fn kind_of(urn: &CapUrn) -> Result<MediaKind, MediaResolveError> {
    if urn.scheme() != "media" {
        return Err(MediaResolveError::NotMediaScheme(urn.to_string()));
    }
    for (flag, kind) in SCALAR_KINDS {
        if matches!(urn.tag(flag), Some(TagValue::Flag)) {
            return Ok(kind.clone());
        }
    }
    if matches!(urn.tag("array"), Some(TagValue::Flag)) {
        let element = match urn.tag("of").and_then(TagValue::text) {
            Some(name) => SCALAR_KINDS
                .iter()
                .find(|(flag, _)| *flag == name)
                .map(|(_, kind)| kind.clone())
                .ok_or_else(|| MediaResolveError::UnknownMedia(urn.to_string()))?,
            // a bare `media:array` is an array of anything
            None => MediaKind::Binary,
        };
        return Ok(MediaKind::Array(Box::new(element)));
    }
    Err(MediaResolveError::UnknownMedia(urn.to_string()))
}

/// Resolve a media URN into its transport-facing description.
pub fn resolve(urn: &CapUrn) -> Result<MediaInfo, MediaResolveError> {
    let kind = kind_of(urn)?;
    Ok(MediaInfo {
        media_type: kind.media_type().to_string(),
        profile_uri: None,
        schema: None,
        validation: None,
        metadata: BTreeMap::new(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(s: &str) -> CapUrn {
        s.parse().unwrap()
    }

    #[test]
    fn builtins_always_resolve() {
        for (name, kind) in SCALAR_KINDS {
            let info = resolve(&urn(&format!("media:{name}"))).unwrap();
            assert_eq!(info.kind, kind);
        }
    }

    #[test]
    fn array_forms_resolve() {
        let info = resolve(&urn("media:array;of=string")).unwrap();
        assert_eq!(info.kind, MediaKind::Array(Box::new(MediaKind::Text)));
        assert_eq!(info.media_type, "application/json");

        let info = resolve(&urn("media:array")).unwrap();
        assert_eq!(info.kind, MediaKind::Array(Box::new(MediaKind::Binary)));
    }

    #[test]
    fn non_media_scheme_rejected() {
        assert!(matches!(
            resolve(&urn("cap:op=x")),
            Err(MediaResolveError::NotMediaScheme(_))
        ));
    }

    #[test]
    fn unknown_media_rejected() {
        assert!(matches!(
            resolve(&urn("media:quaternion")),
            Err(MediaResolveError::UnknownMedia(_))
        ));
        assert!(matches!(
            resolve(&urn("media:array;of=quaternion")),
            Err(MediaResolveError::UnknownMedia(_))
        ));
    }

    #[test]
    fn media_types() {
        assert_eq!(
            resolve(&urn("media:binary")).unwrap().media_type,
            "application/octet-stream"
        );
        assert!(resolve(&urn("media:string"))
            .unwrap()
            .media_type
            .starts_with("text/plain"));
    }
}
