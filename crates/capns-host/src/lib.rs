//! Engine-side plugin host / relay switch for the capns fabric.
//!
//! The host owns a set of endpoints (plugins spawned lazily from a path,
//! or attached over existing byte streams), routes REQ frames to the
//! endpoint whose advertised cap URN accepts the request, routes every
//! continuation frame by message id, forwards plugin-to-plugin peer
//! invocations, aggregates capability advertisements, and converts
//! endpoint death into ERR `ENDPOINT_DIED` for every request in flight
//! through the dead endpoint.
//!
//! [`RelaySlave`] wraps a host for the worker side of a relay pair.

mod endpoint;
mod host;
mod relay;

pub use endpoint::{EndpointId, EndpointRef};
pub use host::{HostError, HostHandle, PluginHost};
pub use relay::{RelaySlave, RelayStateHandle};
