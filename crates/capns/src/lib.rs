//! Capability-oriented RPC fabric.
//!
//! Processes advertise typed capabilities identified by semantic URNs and
//! invoke one another through a framed binary protocol with streaming
//! arguments, streaming responses, back-pressured chunking, and multi-hop
//! routing. This crate re-exports the fabric's layers:
//!
//! - [`urn`]: the capability identifier and matching algebra;
//! - [`wire`]: the frame codec, handshake, limits, and manifest document;
//! - [`runtime`]: the per-plugin event loop, handler surface, and CLI;
//! - [`host`]: the engine-side plugin host / relay switch.
//!
//! A minimal plugin:
//!
//! ```no_run
//! use capns::{HandlerFailure, Manifest, PluginRuntime};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> std::process::ExitCode {
//!     let mut runtime = PluginRuntime::new(Manifest::new("hello", "1.0.0"));
//!     runtime
//!         .register_fn("cap:op=hello".parse().unwrap(), |_req, out, _peer| async move {
//!             out.emit_text("hello").await.map_err(|e| HandlerFailure::new(e.to_string()))
//!         })
//!         .unwrap();
//!     capns::runtime::run_cli(runtime).await
//! }
//! ```

pub use capns_host as host;
pub use capns_runtime as runtime;
pub use capns_urn as urn;
pub use capns_wire as wire;

pub use capns_host::{EndpointId, EndpointRef, HostError, HostHandle, PluginHost, RelaySlave};
pub use capns_runtime::{
    Emitter, Handler, HandlerFailure, LogLevel, PeerArg, PeerInvoker, PluginRuntime, Request,
    RuntimeError,
};
pub use capns_urn::{CapMatcher, CapUrn, TagValue, UrnParseError};
pub use capns_wire::{
    ErrorCode, Frame, FrameType, Limits, Manifest, MessageId, WireError, PROTOCOL_VERSION,
};
