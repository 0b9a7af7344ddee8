use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::TagValue;

/// Characters permitted in tag keys and unquoted values.
fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '*' || c == '-'
}

/// Characters permitted in a scheme (no wildcard).
fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Error type for URN parsing and construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrnParseError {
    /// Input was empty.
    Empty,
    /// No `scheme:` prefix.
    MissingScheme,
    /// A token looked like `key=value` but could not be split that way,
    /// or carried junk after a quoted value.
    MalformedTag(String),
    /// Tag with an empty key.
    EmptyKey,
    /// `key=` with nothing after the equals sign.
    EmptyValue(String),
    /// Character outside the tag charset.
    InvalidChar(char),
    /// The same key appeared twice.
    DuplicateKey(String),
    /// A quoted value never closed.
    UnterminatedQuote,
}

impl fmt::Display for UrnParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrnParseError::Empty => write!(f, "empty URN"),
            UrnParseError::MissingScheme => write!(f, "URN has no scheme prefix"),
            UrnParseError::MalformedTag(t) => write!(f, "malformed tag: {t:?}"),
            UrnParseError::EmptyKey => write!(f, "tag key cannot be empty"),
            UrnParseError::EmptyValue(k) => write!(f, "tag {k:?} has an empty value"),
            UrnParseError::InvalidChar(c) => write!(f, "invalid character {c:?}"),
            UrnParseError::DuplicateKey(k) => write!(f, "duplicate tag key {k:?}"),
            UrnParseError::UnterminatedQuote => write!(f, "unterminated quoted value"),
        }
    }
}

impl std::error::Error for UrnParseError {}

/// A capability (or media) URN: a scheme plus a set of unique tags.
///
/// The tag map is a `BTreeMap`, so iteration order *is* canonical order and
/// structural equality coincides with byte-equality of the canonical
/// serialization.
///
/// # Example
///
/// ```
/// use capns_urn::CapUrn;
///
/// let registered: CapUrn = "cap:op=generate_thumbnail;in=\"media:binary\"".parse().unwrap();
/// let request: CapUrn = "cap:ext=pdf;op=generate_thumbnail;in=\"media:binary\"".parse().unwrap();
/// assert!(registered.accepts(&request));
/// assert_eq!(registered.specificity(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapUrn {
    scheme: String,
    tags: BTreeMap<String, TagValue>,
}

impl CapUrn {
    /// Create an empty URN with the given scheme.
    pub fn new(scheme: &str) -> Result<Self, UrnParseError> {
        if scheme.is_empty() {
            return Err(UrnParseError::MissingScheme);
        }
        if let Some(c) = scheme.chars().find(|c| !is_scheme_char(*c)) {
            return Err(UrnParseError::InvalidChar(c));
        }
        Ok(CapUrn {
            scheme: scheme.to_string(),
            tags: BTreeMap::new(),
        })
    }

    /// Build from a scheme and `(key, value)` pairs.
    pub fn from_tags<I, K>(scheme: &str, tags: I) -> Result<Self, UrnParseError>
    where
        I: IntoIterator<Item = (K, TagValue)>,
        K: Into<String>,
    {
        let mut urn = CapUrn::new(scheme)?;
        for (key, value) in tags {
            urn = urn.with_tag(key.into(), value)?;
        }
        Ok(urn)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Look up a tag by key.
    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Tags in canonical (key-sorted) order.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Return a copy with `key` set to `value`, replacing any existing value.
    pub fn with_tag(&self, key: impl Into<String>, value: TagValue) -> Result<Self, UrnParseError> {
        let key = key.into();
        if key.is_empty() {
            return Err(UrnParseError::EmptyKey);
        }
        if let Some(c) = key.chars().find(|c| !is_tag_char(*c)) {
            return Err(UrnParseError::InvalidChar(c));
        }
        if let TagValue::Value(v) = &value {
            if v.is_empty() {
                return Err(UrnParseError::EmptyValue(key));
            }
            if let Some(c) = v.chars().find(|c| !is_tag_char(*c)) {
                return Err(UrnParseError::InvalidChar(c));
            }
        }
        let mut urn = self.clone();
        urn.tags.insert(key, value);
        Ok(urn)
    }

    /// Return a copy without `key`. Removing an absent key is a no-op.
    pub fn without_tag(&self, key: &str) -> Self {
        let mut urn = self.clone();
        urn.tags.remove(key);
        urn
    }

    /// Directional matching: does this (registered) URN accept `request`?
    ///
    /// For every key on the registered side, the request must carry a
    /// matching value, where wildcards on either side match anything and a
    /// key *missing* from the request counts as a wildcard. Quoted nested
    /// URNs recurse with the same rules. Schemes must be equal.
    pub fn accepts(&self, request: &CapUrn) -> bool {
        if self.scheme != request.scheme {
            return false;
        }
        self.tags.iter().all(|(key, mine)| match request.tags.get(key) {
            None => true,
            Some(theirs) => mine.accepts(theirs),
        })
    }

    /// The number of non-wildcard keys. Flags count; `k=*` does not.
    pub fn specificity(&self) -> usize {
        self.tags.values().filter(|v| !v.is_wildcard()).count()
    }

    /// Symmetric compatibility: for every key present on both sides the
    /// values match or at least one is a wildcard.
    pub fn compatible_with(&self, other: &CapUrn) -> bool {
        if self.scheme != other.scheme {
            return false;
        }
        self.tags.iter().all(|(key, mine)| match other.tags.get(key) {
            None => true,
            Some(theirs) => mine.compatible(theirs),
        })
    }

    /// Strict partial order on compatible URNs: compatible and strictly
    /// higher specificity.
    pub fn more_specific_than(&self, other: &CapUrn) -> bool {
        self.compatible_with(other) && self.specificity() > other.specificity()
    }

    /// True when every tag of `self` appears in `other` with an equal value.
    pub fn is_subset_of(&self, other: &CapUrn) -> bool {
        self.scheme == other.scheme
            && self
                .tags
                .iter()
                .all(|(key, mine)| other.tags.get(key) == Some(mine))
    }

    /// Overlay `other` onto `self`. On key conflicts `other` wins; the
    /// scheme of `self` is kept.
    pub fn merge(&self, other: &CapUrn) -> Self {
        let mut urn = self.clone();
        for (key, value) in &other.tags {
            urn.tags.insert(key.clone(), value.clone());
        }
        urn
    }
}

impl fmt::Display for CapUrn {
    /// Canonical serialization: `scheme:` followed by key-sorted tags
    /// joined with `;`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            match value {
                TagValue::Flag => write!(f, "{key}")?,
                value => write!(f, "{key}={value}")?,
            }
        }
        Ok(())
    }
}

impl FromStr for CapUrn {
    type Err = UrnParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_urn(input)
    }
}

impl Serialize for CapUrn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CapUrn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Split the tag section on `;` at quote depth zero, then parse each token.
fn parse_urn(input: &str) -> Result<CapUrn, UrnParseError> {
    if input.is_empty() {
        return Err(UrnParseError::Empty);
    }
    let colon = input.find(':').ok_or(UrnParseError::MissingScheme)?;
    let mut urn = CapUrn::new(&input[..colon])?;

    let rest = &input[colon + 1..];
    if rest.is_empty() {
        return Ok(urn);
    }

    for token in split_tags(rest)? {
        let (key, value) = parse_tag(&token)?;
        if urn.tags.contains_key(&key) {
            return Err(UrnParseError::DuplicateKey(key));
        }
        urn.tags.insert(key, value);
    }
    Ok(urn)
}

fn split_tags(rest: &str) -> Result<Vec<String>, UrnParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    for c in rest.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quote = !in_quote;
            }
            ';' if !in_quote => {
                tokens.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if in_quote {
        return Err(UrnParseError::UnterminatedQuote);
    }
    tokens.push(current);
    Ok(tokens)
}

fn parse_tag(token: &str) -> Result<(String, TagValue), UrnParseError> {
    if token.is_empty() {
        return Err(UrnParseError::EmptyKey);
    }
    let key_end = token
        .char_indices()
        .find(|(_, c)| !is_tag_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    let key = &token[..key_end];

    match token[key_end..].chars().next() {
        // bare flag
        None => return Ok((key.to_string(), TagValue::Flag)),
        Some('=') if key.is_empty() => return Err(UrnParseError::EmptyKey),
        Some('=') => {}
        // a quote where `=` was expected: looked like key=value, wasn't
        Some('"') => return Err(UrnParseError::MalformedTag(token.to_string())),
        Some(c) => return Err(UrnParseError::InvalidChar(c)),
    }

    let raw = &token[key_end + 1..];
    if raw.is_empty() {
        return Err(UrnParseError::EmptyValue(key.to_string()));
    }

    if let Some(inner) = raw.strip_prefix('"') {
        let (value, consumed) = unescape_quoted(inner)?;
        if consumed != inner.len() {
            // closing quote before the token ended
            return Err(UrnParseError::MalformedTag(token.to_string()));
        }
        return Ok((key.to_string(), TagValue::Quoted(value)));
    }

    if let Some(c) = raw.chars().find(|c| !is_tag_char(*c)) {
        return Err(UrnParseError::InvalidChar(c));
    }
    Ok((key.to_string(), TagValue::Value(raw.to_string())))
}

/// Unescape a quoted value starting just past the opening quote. Returns the
/// value and how many input chars were consumed (including the closing
/// quote).
fn unescape_quoted(inner: &str) -> Result<(String, usize), UrnParseError> {
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        if escaped {
            value.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return Ok((value, i + 1)),
            c => value.push(c),
        }
    }
    Err(UrnParseError::UnterminatedQuote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(s: &str) -> CapUrn {
        s.parse().unwrap()
    }

    #[test]
    fn parse_flag_and_pairs() {
        let u = urn("cap:op=encode;fast;level=3");
        assert_eq!(u.scheme(), "cap");
        assert_eq!(u.tag("op"), Some(&TagValue::Value("encode".into())));
        assert_eq!(u.tag("fast"), Some(&TagValue::Flag));
        assert_eq!(u.tag("level"), Some(&TagValue::Value("3".into())));
        assert_eq!(u.tag_count(), 3);
    }

    #[test]
    fn canonical_form_sorts_by_key() {
        let u = urn("cap:zeta=1;alpha;mid=x");
        assert_eq!(u.to_string(), "cap:alpha;mid=x;zeta=1");
    }

    #[test]
    fn canonical_roundtrip_is_identity() {
        for s in [
            "cap:",
            "media:binary",
            "cap:a;b=2;c=*",
            "cap:in=\"media:binary\";op=generate_thumbnail",
            "cap:v=\"semi;colon=inside\"",
        ] {
            let u = urn(s);
            let reparsed = urn(&u.to_string());
            assert_eq!(u, reparsed);
            assert_eq!(u.to_string(), reparsed.to_string());
        }
    }

    #[test]
    fn equality_is_canonical_byte_equality() {
        assert_eq!(urn("cap:b=2;a=1"), urn("cap:a=1;b=2"));
        assert_ne!(urn("cap:a=1"), urn("cap:a=2"));
        // quoted and unquoted forms of the same text are distinct URNs
        assert_ne!(urn("cap:a=x"), urn("cap:a=\"x\""));
    }

    #[test]
    fn parse_empty_input() {
        assert_eq!("".parse::<CapUrn>(), Err(UrnParseError::Empty));
    }

    #[test]
    fn parse_missing_scheme() {
        assert_eq!("op=x".parse::<CapUrn>(), Err(UrnParseError::MissingScheme));
        assert_eq!(":op=x".parse::<CapUrn>(), Err(UrnParseError::MissingScheme));
    }

    #[test]
    fn parse_empty_key() {
        assert_eq!("cap:;a".parse::<CapUrn>(), Err(UrnParseError::EmptyKey));
        assert_eq!("cap:a;;b".parse::<CapUrn>(), Err(UrnParseError::EmptyKey));
        assert_eq!("cap:=v".parse::<CapUrn>(), Err(UrnParseError::EmptyKey));
    }

    #[test]
    fn parse_empty_value() {
        assert_eq!(
            "cap:op=".parse::<CapUrn>(),
            Err(UrnParseError::EmptyValue("op".into()))
        );
    }

    #[test]
    fn parse_invalid_char() {
        assert_eq!(
            "cap:op=a b".parse::<CapUrn>(),
            Err(UrnParseError::InvalidChar(' '))
        );
        assert_eq!(
            "cap:op=a.b".parse::<CapUrn>(),
            Err(UrnParseError::InvalidChar('.'))
        );
    }

    #[test]
    fn parse_malformed_tag() {
        // quote where `=` was expected
        assert!(matches!(
            "cap:op\"x\"".parse::<CapUrn>(),
            Err(UrnParseError::MalformedTag(_))
        ));
        // junk after the closing quote
        assert!(matches!(
            "cap:op=\"x\"y".parse::<CapUrn>(),
            Err(UrnParseError::MalformedTag(_))
        ));
    }

    #[test]
    fn parse_duplicate_key() {
        assert_eq!(
            "cap:a=1;a=2".parse::<CapUrn>(),
            Err(UrnParseError::DuplicateKey("a".into()))
        );
    }

    #[test]
    fn parse_unterminated_quote() {
        assert_eq!(
            "cap:op=\"never ends".parse::<CapUrn>(),
            Err(UrnParseError::UnterminatedQuote)
        );
    }

    #[test]
    fn quoted_values_keep_semicolons_and_equals() {
        let u = urn("cap:v=\"a=b;c=d\"");
        assert_eq!(u.tag("v"), Some(&TagValue::Quoted("a=b;c=d".into())));
        assert_eq!(u.tag_count(), 1);
    }

    #[test]
    fn quoted_escapes() {
        let u = urn("cap:v=\"say \\\"hi\\\" \\\\ done\"");
        assert_eq!(u.tag("v"), Some(&TagValue::Quoted("say \"hi\" \\ done".into())));
    }

    #[test]
    fn accepts_is_reflexive() {
        for s in ["cap:", "cap:op=x", "cap:op=x;f", "cap:in=\"media:binary\";op=t"] {
            let u = urn(s);
            assert!(u.accepts(&u), "{s} must accept itself");
        }
    }

    #[test]
    fn accepts_wildcard_sides() {
        // wildcard on the registered side
        assert!(urn("cap:op=*").accepts(&urn("cap:op=anything")));
        // wildcard on the request side
        assert!(urn("cap:op=encode").accepts(&urn("cap:op=*")));
        // key missing from the request counts as a wildcard
        assert!(urn("cap:op=encode;ext=pdf").accepts(&urn("cap:op=encode")));
        // but a conflicting value does not
        assert!(!urn("cap:op=encode").accepts(&urn("cap:op=decode")));
    }

    #[test]
    fn accepts_extra_request_keys() {
        // keys missing on the registered side are wildcards there
        assert!(urn("cap:op=encode").accepts(&urn("cap:op=encode;ext=pdf")));
    }

    #[test]
    fn accepts_requires_same_scheme() {
        assert!(!urn("cap:op=x").accepts(&urn("media:op=x")));
    }

    #[test]
    fn accepts_recurses_into_nested_urns() {
        let registered = urn("cap:op=thumb;in=\"media:binary\"");
        let request = urn("cap:op=thumb;in=\"media:binary;ext=pdf\"");
        assert!(registered.accepts(&request));

        let mismatched = urn("cap:op=thumb;in=\"media:string\"");
        assert!(!mismatched.accepts(&request));
    }

    #[test]
    fn two_nested_urns_on_different_keys() {
        let registered = urn("cap:op=convert;in=\"media:binary\";out=\"media:string\"");
        let request = urn("cap:op=convert;in=\"media:binary;ext=pdf\";out=\"media:string\"");
        assert!(registered.accepts(&request));
    }

    #[test]
    fn specificity_counts_non_wildcards() {
        assert_eq!(urn("cap:").specificity(), 0);
        assert_eq!(urn("cap:op=x").specificity(), 1);
        assert_eq!(urn("cap:op=x;e=*").specificity(), 1);
        // flags count
        assert_eq!(urn("cap:op=x;fast").specificity(), 2);
        assert_eq!(
            urn("cap:ext=pdf;in=\"media:binary\";op=generate_thumbnail").specificity(),
            3
        );
    }

    #[test]
    fn more_specific_than_is_strict() {
        let a = urn("cap:op=t;ext=pdf");
        let b = urn("cap:op=t");
        assert!(a.more_specific_than(&b));
        assert!(!b.more_specific_than(&a));
        assert!(!a.more_specific_than(&a));
        // incompatible pairs are never ordered
        let c = urn("cap:op=other;x=1;y=2");
        assert!(!c.more_specific_than(&b));
    }

    #[test]
    fn compatibility() {
        assert!(urn("cap:a=1").compatible_with(&urn("cap:b=2")));
        assert!(urn("cap:a=1").compatible_with(&urn("cap:a=*")));
        assert!(!urn("cap:a=1").compatible_with(&urn("cap:a=2")));
    }

    #[test]
    fn subset_and_merge() {
        let small = urn("cap:a=1");
        let big = urn("cap:a=1;b=2");
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));

        let merged = small.merge(&urn("cap:a=9;c=3"));
        assert_eq!(merged, urn("cap:a=9;c=3"));
        let merged = big.merge(&urn("cap:c=3"));
        assert_eq!(merged, urn("cap:a=1;b=2;c=3"));
    }

    #[test]
    fn with_and_without_tag() {
        let u = urn("cap:op=x");
        let u2 = u.with_tag("ext", TagValue::Value("pdf".into())).unwrap();
        assert_eq!(u2.to_string(), "cap:ext=pdf;op=x");
        assert_eq!(u2.without_tag("ext"), u);
        assert_eq!(u.without_tag("missing"), u);

        assert_eq!(
            u.with_tag("", TagValue::Flag),
            Err(UrnParseError::EmptyKey)
        );
        assert_eq!(
            u.with_tag("bad key", TagValue::Flag),
            Err(UrnParseError::InvalidChar(' '))
        );
        assert_eq!(
            u.with_tag("k", TagValue::Value("".into())),
            Err(UrnParseError::EmptyValue("k".into()))
        );
    }

    #[test]
    fn serde_roundtrip_as_string() {
        let u = urn("cap:in=\"media:binary\";op=t");
        let json = serde_json::to_string(&u).unwrap();
        assert_eq!(json, "\"cap:in=\\\"media:binary\\\";op=t\"");
        let back: CapUrn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, u);
    }
}
