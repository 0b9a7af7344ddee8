//! Argument validation against a capability declaration.
//!
//! Runs before a request is built (CLI mode) or bound (callers that opt
//! in): order and arity from the declaration, media compatibility via the
//! `accepts` relation, and a content check per built-in kind. Failures
//! surface as `PAYLOAD_ERROR` on the wire.

use std::fmt;

use bytes::Bytes;
use capns_urn::CapUrn;
use capns_wire::CapDecl;

use crate::media::{kind_of, MediaKind, MediaResolveError};

/// A descriptive argument-binding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required argument is absent.
    MissingRequired { index: usize, media_urn: String },
    /// More arguments than the declaration lists.
    TooMany { declared: usize, got: usize },
    /// The provided media URN is not accepted by the declared one.
    MediaMismatch {
        index: usize,
        declared: String,
        provided: String,
    },
    /// The value bytes do not parse as the declared kind.
    BadValue {
        index: usize,
        kind: String,
        detail: String,
    },
    /// The declaration itself names an unresolvable media URN.
    Unresolvable(MediaResolveError),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRequired { index, media_urn } => {
                write!(f, "argument {index} ({media_urn}) is required")
            }
            ValidationError::TooMany { declared, got } => {
                write!(f, "got {got} arguments, capability declares {declared}")
            }
            ValidationError::MediaMismatch {
                index,
                declared,
                provided,
            } => write!(
                f,
                "argument {index}: declared media {declared} does not accept {provided}"
            ),
            ValidationError::BadValue {
                index,
                kind,
                detail,
            } => write!(f, "argument {index} is not a valid {kind}: {detail}"),
            ValidationError::Unresolvable(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ValidationError {}

fn check_content(kind: &MediaKind, index: usize, value: &[u8]) -> Result<(), ValidationError> {
    let bad = |detail: String| ValidationError::BadValue {
        index,
        kind: kind.to_string(),
        detail,
    };
    let as_text = || {
        std::str::from_utf8(value).map_err(|_| bad("not valid UTF-8".to_string()))
    };
    match kind {
        MediaKind::Binary => Ok(()),
        MediaKind::Void => {
            if value.is_empty() {
                Ok(())
            } else {
                Err(bad(format!("{} unexpected bytes", value.len())))
            }
        }
        MediaKind::Text => as_text().map(|_| ()),
        MediaKind::Integer => {
            let text = as_text()?;
            text.trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|e| bad(e.to_string()))
        }
        MediaKind::Number => {
            let text = as_text()?;
            text.trim()
                .parse::<f64>()
                .map(|_| ())
                .map_err(|e| bad(e.to_string()))
        }
        MediaKind::Boolean => match as_text()?.trim() {
            "true" | "false" => Ok(()),
            other => Err(bad(format!("{other:?} is not true/false"))),
        },
        MediaKind::Object => match serde_json::from_slice::<serde_json::Value>(value) {
            Ok(serde_json::Value::Object(_)) => Ok(()),
            Ok(_) => Err(bad("JSON is not an object".to_string())),
            Err(e) => Err(bad(e.to_string())),
        },
        MediaKind::Array(_) => match serde_json::from_slice::<serde_json::Value>(value) {
            Ok(serde_json::Value::Array(_)) => Ok(()),
            Ok(_) => Err(bad("JSON is not an array".to_string())),
            Err(e) => Err(bad(e.to_string())),
        },
    }
}

/// Validate an ordered argument list against a capability declaration.
///
/// `args` pairs each provided value with the media URN it was sent under.
pub fn validate_args(decl: &CapDecl, args: &[(String, Bytes)]) -> Result<(), ValidationError> {
    if args.len() > decl.args.len() {
        return Err(ValidationError::TooMany {
            declared: decl.args.len(),
            got: args.len(),
        });
    }
    for (index, arg_decl) in decl.args.iter().enumerate() {
        let Some((provided_media, value)) = args.get(index) else {
            if arg_decl.required {
                return Err(ValidationError::MissingRequired {
                    index,
                    media_urn: arg_decl.media_urn.to_string(),
                });
            }
            continue;
        };

        let kind = kind_of(&arg_decl.media_urn).map_err(ValidationError::Unresolvable)?;

        // media URNs compare by the `accepts` relation and by built-in
        // kind, never byte-for-byte
        if let Ok(provided) = provided_media.parse::<CapUrn>() {
            let compatible = arg_decl.media_urn.accepts(&provided)
                && match kind_of(&provided) {
                    Ok(provided_kind) => provided_kind == kind,
                    // an extended media URN; the accepts relation decides
                    Err(_) => true,
                };
            if !compatible {
                return Err(ValidationError::MediaMismatch {
                    index,
                    declared: arg_decl.media_urn.to_string(),
                    provided: provided.to_string(),
                });
            }
        }

        check_content(&kind, index, value)?;
    }
    Ok(())
}
