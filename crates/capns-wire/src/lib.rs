//! Framed binary wire protocol for the capns fabric.
//!
//! Every frame on the wire is a 32-bit big-endian length prefix followed by
//! a self-describing CBOR map whose keys are small fixed integers (see
//! [`keys`](codec::keys)). The assignment is additive-only; decoders reject
//! unknown protocol versions, the obsolete legacy frame type `2`, and frames
//! missing their per-type required fields.
//!
//! This crate carries everything both ends of a transport agree on:
//! the [`Frame`] model and [`FrameType`] enumeration, the codec
//! ([`read_frame`]/[`write_frame`]), 16-byte [`MessageId`]s, the FNV-1a
//! checksum, [`Limits`] and their min-negotiation, the [`handshake`], the
//! wire [`ErrorCode`]s, and the plugin [`Manifest`] document.

mod checksum;
mod codec;
mod error;
mod frame;
pub mod handshake;
mod id;
mod limits;
mod manifest;
mod recent;

pub use checksum::fnv1a_64;
pub use codec::{decode_frame, encode_frame, keys, read_frame, write_frame, WireError};
pub use error::ErrorCode;
pub use frame::{Frame, FrameType, FrameValidationError, PROTOCOL_VERSION};
pub use id::MessageId;
pub use limits::Limits;
pub use manifest::{ArgDecl, ArgSource, CapDecl, Manifest, ManifestError, OutputDecl};
pub use recent::RecentIds;
