use std::fmt;

use crate::CapUrn;

/// The value side of a single URN tag.
///
/// A *flag* is a bare key with no `=` (`cap:binary`). Unquoted values are
/// drawn from the tag charset; the single character `*` is the wildcard.
/// Quoted values may contain any character (with `\"` and `\\` escapes) and
/// are how one URN nests inside another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagValue {
    /// Bare key, no value.
    Flag,
    /// Unquoted value from `[A-Za-z0-9_*-]+`.
    Value(String),
    /// Quoted value; stored unescaped.
    Quoted(String),
}

impl TagValue {
    /// The unquoted wildcard `*`.
    pub fn wildcard() -> Self {
        TagValue::Value("*".to_string())
    }

    /// True for the unquoted value `*`. A quoted `"*"` is a literal string.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, TagValue::Value(v) if v == "*")
    }

    /// The inner text of a value, if any. Flags have none.
    pub fn text(&self) -> Option<&str> {
        match self {
            TagValue::Flag => None,
            TagValue::Value(v) | TagValue::Quoted(v) => Some(v),
        }
    }

    /// Directional match used by [`CapUrn::accepts`]: `self` is the
    /// registered side, `request` the incoming side.
    ///
    /// Either side being a wildcard matches. Flags match only flags. When
    /// both sides are quoted and both parse as URNs, matching recurses with
    /// [`CapUrn::accepts`]; otherwise values compare by their inner text.
    pub(crate) fn accepts(&self, request: &TagValue) -> bool {
        if self.is_wildcard() || request.is_wildcard() {
            return true;
        }
        match (self, request) {
            (TagValue::Flag, TagValue::Flag) => true,
            (TagValue::Flag, _) | (_, TagValue::Flag) => false,
            (TagValue::Quoted(a), TagValue::Quoted(r)) => {
                match (a.parse::<CapUrn>(), r.parse::<CapUrn>()) {
                    (Ok(a_urn), Ok(r_urn)) => a_urn.accepts(&r_urn),
                    _ => a == r,
                }
            }
            (a, r) => a.text() == r.text(),
        }
    }

    /// Symmetric compatibility: values match, or at least one is a wildcard.
    /// Nested quoted URNs are compatible when their URNs are.
    pub(crate) fn compatible(&self, other: &TagValue) -> bool {
        if self.is_wildcard() || other.is_wildcard() {
            return true;
        }
        match (self, other) {
            (TagValue::Flag, TagValue::Flag) => true,
            (TagValue::Flag, _) | (_, TagValue::Flag) => false,
            (TagValue::Quoted(a), TagValue::Quoted(b)) => {
                match (a.parse::<CapUrn>(), b.parse::<CapUrn>()) {
                    (Ok(a_urn), Ok(b_urn)) => a_urn.compatible_with(&b_urn),
                    _ => a == b,
                }
            }
            (a, b) => a.text() == b.text(),
        }
    }
}

impl fmt::Display for TagValue {
    /// Canonical rendering of the value side (without the key).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Flag => Ok(()),
            TagValue::Value(v) => write!(f, "{v}"),
            TagValue::Quoted(v) => {
                f.write_str("\"")?;
                for c in v.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}
