//! Capability URN algebra.
//!
//! A capability URN identifies an operation a process offers as an ordered,
//! deduplicated set of tags: `cap:op=generate_thumbnail;ext=pdf;in="media:binary"`.
//! Each tag is a bare *flag* (`binary`) or a `key=value` pair; values may be
//! quoted, which permits nesting another URN inside a tag (the `in=` example
//! above). The same grammar serves media URNs (`media:string`,
//! `media:array;of=string`).
//!
//! The algebra defines:
//! - a **canonical form** (tags sorted by key, each key unique); two URNs are
//!   equal iff their canonical serializations are byte-identical;
//! - a directional **`accepts`** relation used to match a registered capability
//!   against a request;
//! - **specificity** (the count of non-wildcard keys) used to pick the best
//!   match among several accepting candidates.
//!
//! [`CapMatcher`] packages the selection rules: most specific accepting
//! candidate wins, first-registered wins ties.

mod matcher;
mod tag;
mod urn;

pub use matcher::CapMatcher;
pub use tag::TagValue;
pub use urn::{CapUrn, UrnParseError};
