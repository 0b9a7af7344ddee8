//! Plugin-side runtime for the capns fabric.
//!
//! A plugin process builds a [`PluginRuntime`] from its [`Manifest`]
//! (re-exported from `capns-wire`), registers handlers keyed by cap URN,
//! and calls [`PluginRuntime::run`] over its transport (usually stdio).
//! The runtime owns the event loop: it demultiplexes incoming streams,
//! spawns one task per request, multiplexes handler output through a
//! single writer guardian, issues peer invocations, and converts every
//! protocol violation into the right ERR frame.
//!
//! [`run_cli`] wraps a runtime in the standard plugin command-line
//! surface: wire mode by default, `manifest` / `--help` introspection, and
//! direct in-process command execution.
//!
//! [`Manifest`]: capns_wire::Manifest

mod cli;
mod emitter;
mod handler;
mod media;
mod peer;
mod runtime;
mod validate;
mod wrap;

pub use cli::run_cli;
pub use emitter::{EmitError, Emitter, LogLevel};
pub use handler::{AlreadyRegistered, Handler, HandlerFailure, Request};
pub use media::{kind_of, resolve, MediaInfo, MediaKind, MediaResolveError};
pub use peer::{PeerArg, PeerError, PeerInvoker, PeerResponse};
pub use runtime::{
    PluginRuntime, RuntimeError, HANDLER_CHANNEL_CAPACITY, OUTBOUND_QUEUE_CAPACITY,
};
pub use validate::{validate_args, ValidationError};
pub use wrap::{ResponseValue, WrapError};
