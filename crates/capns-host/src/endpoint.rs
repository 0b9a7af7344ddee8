//! Endpoint bookkeeping: one entry per plugin the host knows, whether
//! lazily registered (spawn on first matching REQ) or attached running.

use std::fmt;
use std::path::PathBuf;

use capns_urn::CapUrn;
use capns_wire::{Frame, Limits, Manifest};
use tokio::process::Child;
use tokio::sync::mpsc;

/// Index into the host's endpoint table.
pub type EndpointId = usize;

/// One party of a routing entry. `Engine` is the sentinel distinguishing
/// engine-originated requests from peer-originated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRef {
    Engine,
    Plugin(EndpointId),
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRef::Engine => write!(f, "engine"),
            EndpointRef::Plugin(id) => write!(f, "plugin#{id}"),
        }
    }
}

/// Endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointState {
    /// Registered with known caps; process not started yet.
    Registered,
    /// Handshaken and serving.
    Running,
    /// Spawn failed; never retried, requests get SPAWN_FAILED.
    Poisoned,
    /// Transport closed or process gone.
    Dead,
}

pub(crate) struct Endpoint {
    pub name: String,
    /// Spawn command for lazy plugins; attached plugins have none.
    pub path: Option<PathBuf>,
    /// Caps advertised before the real manifest exists.
    pub known_caps: Vec<CapUrn>,
    pub state: EndpointState,
    pub manifest: Option<Manifest>,
    /// Limits negotiated with this endpoint.
    pub limits: Option<Limits>,
    /// Sender into this endpoint's writer pump.
    pub writer: Option<mpsc::Sender<Frame>>,
    pub child: Option<Child>,
}

impl Endpoint {
    pub fn registered(path: PathBuf, known_caps: Vec<CapUrn>) -> Self {
        Endpoint {
            name: path.display().to_string(),
            path: Some(path),
            known_caps,
            state: EndpointState::Registered,
            manifest: None,
            limits: None,
            writer: None,
            child: None,
        }
    }

    pub fn attached(name: String, manifest: Manifest, limits: Limits) -> Self {
        Endpoint {
            name,
            path: None,
            known_caps: Vec::new(),
            state: EndpointState::Running,
            manifest: Some(manifest),
            limits: Some(limits),
            writer: None,
            child: None,
        }
    }

    /// The caps this endpoint serves: the manifest once there is one,
    /// the registration's known caps before that.
    pub fn caps(&self) -> Vec<CapUrn> {
        match &self.manifest {
            Some(manifest) => manifest.caps.iter().map(|c| c.urn.clone()).collect(),
            None => self.known_caps.clone(),
        }
    }

    /// Healthy endpoints participate in routing and aggregation.
    pub fn is_healthy(&self) -> bool {
        matches!(self.state, EndpointState::Registered | EndpointState::Running)
    }
}
