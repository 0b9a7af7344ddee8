//! The worker-process half of a relay pair.
//!
//! A relay slave is a [`PluginHost`] running inside a worker process,
//! upstream of the engine's master host. Toward its own plugins it is an
//! ordinary host; toward the engine it additionally speaks the two relay
//! frames: it emits RELAY_NOTIFY whenever its aggregate manifest or
//! limits change, and it intercepts RELAY_STATE from the master, storing
//! the opaque payload where the worker can read it. Neither frame ever
//! reaches a plugin runtime.
//!
//! The master needs no wrapper: a plain host already intercepts
//! RELAY_NOTIFY from attached endpoints and can push state down with
//! [`HostHandle::send_host_state`](crate::HostHandle::send_host_state).

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{HostError, PluginHost};

/// Read access to the host-resource state the master last pushed down.
#[derive(Clone)]
pub struct RelayStateHandle {
    slot: Arc<Mutex<Option<Bytes>>>,
}

impl RelayStateHandle {
    /// The most recent RELAY_STATE payload, if any arrived yet.
    pub fn get(&self) -> Option<Bytes> {
        self.slot.lock().clone()
    }
}

/// A host wrapped for the slave side of a relay pair.
pub struct RelaySlave {
    host: PluginHost,
    slot: Arc<Mutex<Option<Bytes>>>,
}

impl RelaySlave {
    pub fn new(host: PluginHost) -> Self {
        RelaySlave {
            host,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn host(&mut self) -> &mut PluginHost {
        &mut self.host
    }

    pub fn host_state(&self) -> RelayStateHandle {
        RelayStateHandle {
            slot: self.slot.clone(),
        }
    }

    /// Drive the host against the upstream (master) transport.
    pub async fn run<R, W>(self, upstream_reader: R, upstream_writer: W) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.host
            .run_inner(upstream_reader, upstream_writer, Some(self.slot))
            .await
    }
}
