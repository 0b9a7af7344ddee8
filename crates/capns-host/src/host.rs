//! The plugin host / relay switch.
//!
//! One host runs per engine (or per relay worker). It owns N endpoints,
//! routes REQ frames by cap URN, routes continuation frames by message
//! id, forwards peer invocations plugin-to-plugin, and contains failures:
//! a dead endpoint cascades ERR `ENDPOINT_DIED` onto every in-flight
//! request that touched it and is never selected again.
//!
//! Concurrency shape: every transport has one reader task and one writer
//! pump. Endpoint readers feed a single event channel consumed by the
//! main loop, which also reads the engine transport directly; all shared
//! tables live behind one mutex with short, await-free critical sections.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use capns_urn::CapUrn;
use capns_wire::{
    handshake, read_frame, write_frame, ErrorCode, Frame, FrameType, Limits, Manifest,
    ManifestError, MessageId, RecentIds, WireError,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::endpoint::{Endpoint, EndpointState};
use crate::{EndpointId, EndpointRef};

/// Capacity of each writer pump's queue.
const WRITER_QUEUE_CAPACITY: usize = 64;

/// Capacity of the endpoint-event channel feeding the main loop.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// How many terminated message ids the host remembers.
const TERMINATED_MEMORY: usize = 1024;

/// Fatal errors that stop [`PluginHost::run`].
#[derive(Debug)]
pub enum HostError {
    /// Engine-transport integrity failure.
    Wire(WireError),
    /// The aggregate manifest does not serialize, or a peer's manifest is
    /// malformed during attach.
    Manifest(ManifestError),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Wire(e) => write!(f, "engine transport failure: {e}"),
            HostError::Manifest(e) => write!(f, "manifest error: {e}"),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::Wire(e) => Some(e),
            HostError::Manifest(e) => Some(e),
        }
    }
}

impl From<WireError> for HostError {
    fn from(e: WireError) -> Self {
        HostError::Wire(e)
    }
}

/// Per-in-flight-request routing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RouteEntry {
    id: MessageId,
    source: EndpointRef,
    dest: EndpointRef,
    /// True when the request originated from a plugin rather than the
    /// engine. Preserved because the two kinds clean up at different
    /// moments of the terminal frame's journey.
    peer_originated: bool,
}

/// Everything guarded by the host's single exclusion domain.
struct HostState {
    endpoints: Vec<Endpoint>,
    /// Ordered `(cap, endpoint)` pairs; rebuilt on any endpoint change.
    cap_table: Vec<(CapUrn, EndpointId)>,
    routes: HashMap<String, RouteEntry>,
    terminated: RecentIds,
}

impl HostState {
    fn rebuild_cap_table(&mut self) {
        self.cap_table.clear();
        for (id, endpoint) in self.endpoints.iter().enumerate() {
            if !endpoint.is_healthy() {
                continue;
            }
            for cap in endpoint.caps() {
                self.cap_table.push((cap, id));
            }
        }
    }

    /// First exact match, else first entry whose URN accepts the request.
    fn find_endpoint(&self, cap: &CapUrn) -> Option<EndpointId> {
        if let Some((_, id)) = self.cap_table.iter().find(|(urn, _)| urn == cap) {
            return Some(*id);
        }
        self.cap_table
            .iter()
            .find(|(urn, _)| urn.accepts(cap))
            .map(|(_, id)| *id)
    }
}

/// Endpoint reader events consumed by the main loop.
enum Event {
    Frame { endpoint: EndpointId, frame: Frame },
    Closed { endpoint: EndpointId },
}

/// The plugin host. Register or attach endpoints, then [`run`](Self::run)
/// against the engine transport.
pub struct PluginHost {
    name: String,
    /// The host's own limit proposal, used toward every endpoint.
    limits: Limits,
    state: Arc<Mutex<HostState>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

/// A cheap handle for operations that outlive `run`'s borrow of the host,
/// currently sending opaque host-resource state to a relay-slave endpoint.
#[derive(Clone)]
pub struct HostHandle {
    state: Arc<Mutex<HostState>>,
}

impl HostHandle {
    /// Queue a RELAY_STATE frame toward an endpoint. Returns false when
    /// the endpoint is not running.
    pub async fn send_host_state(&self, endpoint: EndpointId, state: Bytes) -> bool {
        let writer = {
            let guard = self.state.lock();
            guard
                .endpoints
                .get(endpoint)
                .and_then(|e| e.writer.clone())
        };
        match writer {
            Some(writer) => writer
                .send(Frame::relay_state(MessageId::random(), state))
                .await
                .is_ok(),
            None => false,
        }
    }
}

impl PluginHost {
    pub fn new(name: impl Into<String>, limits: Limits) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        PluginHost {
            name: name.into(),
            limits,
            state: Arc::new(Mutex::new(HostState {
                endpoints: Vec::new(),
                cap_table: Vec::new(),
                routes: HashMap::new(),
                terminated: RecentIds::new(TERMINATED_MEMORY),
            })),
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            state: self.state.clone(),
        }
    }

    /// Register a lazy plugin: spawned on the first REQ whose cap matches
    /// one of `known_caps`.
    pub fn register_plugin(
        &mut self,
        path: impl Into<PathBuf>,
        known_caps: Vec<CapUrn>,
    ) -> EndpointId {
        let mut state = self.state.lock();
        let id = state.endpoints.len();
        let endpoint = Endpoint::registered(path.into(), known_caps);
        info!(endpoint = id, name = %endpoint.name, "registered plugin");
        state.endpoints.push(endpoint);
        state.rebuild_cap_table();
        id
    }

    /// Attach an already-running plugin over its byte streams. Performs
    /// the handshake immediately.
    pub async fn attach_plugin<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<EndpointId, HostError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let manifest_bytes = self
            .aggregate_manifest()
            .to_bytes()
            .map_err(HostError::Manifest)?;
        let outcome =
            handshake::initiate(&mut reader, &mut writer, manifest_bytes, self.limits).await?;
        let manifest =
            Manifest::from_bytes(&outcome.peer_manifest).map_err(HostError::Manifest)?;
        let limits = outcome.limits;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        let id = {
            let mut state = self.state.lock();
            let id = state.endpoints.len();
            let mut endpoint =
                Endpoint::attached(format!("attached:{}", manifest.name), manifest, limits);
            endpoint.writer = Some(writer_tx);
            state.endpoints.push(endpoint);
            state.rebuild_cap_table();
            id
        };
        info!(endpoint = id, "attached plugin");

        tokio::spawn(writer_pump(writer, limits, writer_rx));
        tokio::spawn(endpoint_reader(
            id,
            reader,
            limits.max_frame,
            self.events_tx.clone(),
        ));
        Ok(id)
    }

    /// Union of healthy endpoints' caps, deduplicated; lazily registered
    /// endpoints contribute synthesized declarations for their known caps.
    pub fn aggregate_manifest(&self) -> Manifest {
        let state = self.state.lock();
        let mut manifest = Manifest::aggregate(
            self.name.clone(),
            state
                .endpoints
                .iter()
                .filter(|e| e.is_healthy())
                .filter_map(|e| e.manifest.as_ref()),
        );
        for endpoint in state.endpoints.iter().filter(|e| e.is_healthy()) {
            for cap in &endpoint.known_caps {
                if manifest.find_cap(cap).is_none() {
                    let canonical = cap.to_string();
                    manifest.caps.push(capns_wire::CapDecl {
                        urn: cap.clone(),
                        title: canonical.clone(),
                        description: None,
                        command: canonical,
                        args: Vec::new(),
                        output: None,
                        metadata: Default::default(),
                    });
                }
            }
        }
        manifest
    }

    /// Component-wise min over the host's own limits and every healthy
    /// endpoint's negotiated limits.
    pub fn aggregate_limits(&self) -> Limits {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .filter(|e| e.is_healthy())
            .filter_map(|e| e.limits.as_ref())
            .fold(self.limits, |acc, limits| acc.negotiate(limits))
    }

    /// All caps currently routable, in table order.
    pub fn aggregate_caps(&self) -> Vec<CapUrn> {
        self.state
            .lock()
            .cap_table
            .iter()
            .map(|(cap, _)| cap.clone())
            .collect()
    }

    /// Drive the host against the engine transport until the engine
    /// closes it.
    pub async fn run<R, W>(self, engine_reader: R, engine_writer: W) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.run_inner(engine_reader, engine_writer, None).await
    }

    pub(crate) async fn run_inner<R, W>(
        self,
        mut engine_reader: R,
        mut engine_writer: W,
        relay_state: Option<Arc<Mutex<Option<Bytes>>>>,
    ) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let manifest_bytes = self
            .aggregate_manifest()
            .to_bytes()
            .map_err(HostError::Manifest)?;
        let engine_limits = {
            let outcome = handshake::accept(
                &mut engine_reader,
                &mut engine_writer,
                manifest_bytes,
                self.aggregate_limits(),
            )
            .await?;
            outcome.limits
        };
        debug!(host = %self.name, limits = %engine_limits, "engine handshake complete");

        let (engine_tx, engine_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        let writer_task = tokio::spawn(writer_pump(engine_writer, engine_limits, engine_rx));

        let relay = relay_state.is_some();
        let mut switch = Switch {
            name: self.name,
            limits: self.limits,
            state: self.state,
            events_tx: self.events_tx,
            engine_tx,
            relay,
            relay_state,
        };
        let mut events_rx = self.events_rx;

        let result = loop {
            tokio::select! {
                read = read_frame(&mut engine_reader, engine_limits.max_frame) => match read {
                    Ok(Some(frame)) => switch.on_engine_frame(frame).await,
                    Ok(None) => {
                        debug!("engine closed the transport");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(error = %e, "engine transport integrity failure");
                        break Err(HostError::Wire(e));
                    }
                },
                Some(event) = events_rx.recv() => match event {
                    Event::Frame { endpoint, frame } =>
                        switch.on_endpoint_frame(endpoint, frame).await,
                    Event::Closed { endpoint } =>
                        switch.on_endpoint_death(endpoint).await,
                },
            }
        };

        switch.shutdown();
        drop(switch);
        let _ = writer_task.await;
        result
    }
}

/// The running half of the host: everything the main loop needs.
struct Switch {
    name: String,
    limits: Limits,
    state: Arc<Mutex<HostState>>,
    events_tx: mpsc::Sender<Event>,
    engine_tx: mpsc::Sender<Frame>,
    /// Relay-slave mode: notify upstream on aggregate changes and accept
    /// RELAY_STATE from upstream.
    relay: bool,
    relay_state: Option<Arc<Mutex<Option<Bytes>>>>,
}

impl Switch {
    async fn send_to(&self, target: EndpointRef, frame: Frame) {
        match target {
            EndpointRef::Engine => {
                let _ = self.engine_tx.send(frame).await;
            }
            EndpointRef::Plugin(id) => {
                let writer = {
                    let state = self.state.lock();
                    state.endpoints.get(id).and_then(|e| e.writer.clone())
                };
                if let Some(writer) = writer {
                    let _ = writer.send(frame).await;
                }
            }
        }
    }

    async fn on_engine_frame(&mut self, frame: Frame) {
        match frame.frame_type {
            FrameType::Heartbeat => {
                let _ = self.engine_tx.send(Frame::heartbeat(frame.id)).await;
            }
            FrameType::Hello => {
                self.send_to(
                    EndpointRef::Engine,
                    Frame::err(frame.id, ErrorCode::ProtocolError, "HELLO after handshake"),
                )
                .await;
            }
            FrameType::RelayState => match &self.relay_state {
                Some(slot) => {
                    // master-to-slave host-resource state; stored, never
                    // forwarded to any plugin
                    *slot.lock() = frame.payload.clone();
                    debug!("stored relay host state");
                }
                None => warn!("RELAY_STATE outside a relay pair, dropped"),
            },
            FrameType::RelayNotify => {
                warn!("RELAY_NOTIFY from the engine side, dropped");
            }
            FrameType::Req => self.route_request(EndpointRef::Engine, frame).await,
            FrameType::StreamStart
            | FrameType::Chunk
            | FrameType::StreamEnd
            | FrameType::Log
            | FrameType::End
            | FrameType::Err => self.route_continuation(EndpointRef::Engine, frame).await,
        }
    }

    async fn on_endpoint_frame(&mut self, endpoint: EndpointId, frame: Frame) {
        match frame.frame_type {
            FrameType::RelayNotify => self.on_relay_notify(endpoint, frame).await,
            FrameType::RelayState => {
                warn!(endpoint, "RELAY_STATE from an endpoint, dropped");
            }
            FrameType::Heartbeat => {
                self.send_to(EndpointRef::Plugin(endpoint), Frame::heartbeat(frame.id))
                    .await;
            }
            FrameType::Hello => {
                self.send_to(
                    EndpointRef::Plugin(endpoint),
                    Frame::err(frame.id, ErrorCode::ProtocolError, "HELLO after handshake"),
                )
                .await;
            }
            FrameType::Req => {
                self.route_request(EndpointRef::Plugin(endpoint), frame)
                    .await
            }
            FrameType::StreamStart
            | FrameType::Chunk
            | FrameType::StreamEnd
            | FrameType::Log
            | FrameType::End
            | FrameType::Err => {
                self.route_continuation(EndpointRef::Plugin(endpoint), frame)
                    .await
            }
        }
    }

    /// A relay-slave endpoint pushed a fresh aggregate: adopt its caps and
    /// limits, and propagate upstream if we are a slave ourselves.
    async fn on_relay_notify(&mut self, endpoint: EndpointId, frame: Frame) {
        let Some(meta) = &frame.meta else { return };
        let manifest = meta
            .get("manifest")
            .and_then(|json| Manifest::from_bytes(json.as_bytes()).ok());
        let limits = Limits::from_meta(meta);
        let Some(manifest) = manifest else {
            warn!(endpoint, "RELAY_NOTIFY with unusable manifest");
            return;
        };
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.endpoints.get_mut(endpoint) {
                entry.manifest = Some(manifest);
                if let Some(limits) = limits {
                    entry.limits = Some(limits);
                }
            }
            state.rebuild_cap_table();
        }
        debug!(endpoint, "adopted relayed manifest");
        self.notify_upstream().await;
    }

    /// In relay-slave mode, push the current aggregate upstream.
    async fn notify_upstream(&self) {
        if !self.relay {
            return;
        }
        let manifest = self.current_aggregate_manifest();
        let limits = self.current_aggregate_limits();
        match serde_manifest_json(&manifest) {
            Some(json) => {
                let _ = self
                    .engine_tx
                    .send(Frame::relay_notify(MessageId::random(), json, limits))
                    .await;
            }
            None => warn!("aggregate manifest failed to serialize"),
        }
    }

    fn current_aggregate_manifest(&self) -> Manifest {
        let state = self.state.lock();
        Manifest::aggregate(
            self.name.clone(),
            state
                .endpoints
                .iter()
                .filter(|e| e.is_healthy())
                .filter_map(|e| e.manifest.as_ref()),
        )
    }

    fn current_aggregate_limits(&self) -> Limits {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .filter(|e| e.is_healthy())
            .filter_map(|e| e.limits.as_ref())
            .fold(self.limits, |acc, limits| acc.negotiate(limits))
    }

    async fn route_request(&mut self, source: EndpointRef, frame: Frame) {
        let id = frame.id;
        let key = id.to_canonical();

        let duplicate = {
            let state = self.state.lock();
            state.routes.contains_key(&key) || state.terminated.contains(&key)
        };
        if duplicate {
            let mut state = self.state.lock();
            state.routes.remove(&key);
            state.terminated.insert(key);
            drop(state);
            self.send_to(
                source,
                Frame::err(id, ErrorCode::ProtocolError, "duplicate REQ"),
            )
            .await;
            return;
        }

        if frame.has_forbidden_payload() {
            self.state.lock().terminated.insert(key);
            self.send_to(
                source,
                Frame::err(id, ErrorCode::ProtocolError, "REQ payload must be empty"),
            )
            .await;
            return;
        }

        let cap: CapUrn = match frame.cap.as_deref().unwrap_or_default().parse() {
            Ok(cap) => cap,
            Err(e) => {
                self.state.lock().terminated.insert(key);
                self.send_to(
                    source,
                    Frame::err(id, ErrorCode::InvalidRequest, format!("malformed cap URN: {e}")),
                )
                .await;
                return;
            }
        };

        let found = {
            let state = self.state.lock();
            state
                .find_endpoint(&cap)
                .map(|dest| (dest, state.endpoints[dest].state))
        };
        let (dest, dest_state) = match found {
            Some(found) => found,
            None => {
                self.state.lock().terminated.insert(key);
                self.send_to(
                    source,
                    Frame::err(id, ErrorCode::NoHandler, format!("no endpoint serves {cap}")),
                )
                .await;
                return;
            }
        };

        match dest_state {
            EndpointState::Running => {}
            EndpointState::Registered => {
                if let Err(reason) = self.spawn_endpoint(dest).await {
                    self.state.lock().terminated.insert(key);
                    self.send_to(source, Frame::err(id, ErrorCode::SpawnFailed, reason))
                        .await;
                    return;
                }
                self.notify_upstream().await;
            }
            EndpointState::Poisoned => {
                self.state.lock().terminated.insert(key);
                self.send_to(
                    source,
                    Frame::err(
                        id,
                        ErrorCode::SpawnFailed,
                        "endpoint poisoned by an earlier spawn failure",
                    ),
                )
                .await;
                return;
            }
            EndpointState::Dead => {
                // dead endpoints leave the cap table on rebuild; if one
                // slips through, the request has no serving endpoint
                self.state.lock().terminated.insert(key);
                self.send_to(
                    source,
                    Frame::err(id, ErrorCode::NoHandler, format!("no endpoint serves {cap}")),
                )
                .await;
                return;
            }
        }

        let peer_originated = source != EndpointRef::Engine;
        debug!(%id, %cap, %source, dest, peer_originated, "routing request");
        self.state.lock().routes.insert(
            key,
            RouteEntry {
                id,
                source,
                dest: EndpointRef::Plugin(dest),
                peer_originated,
            },
        );
        self.send_to(EndpointRef::Plugin(dest), frame).await;
    }

    async fn route_continuation(&mut self, sender: EndpointRef, frame: Frame) {
        let id = frame.id;
        let key = id.to_canonical();

        let route = { self.state.lock().routes.get(&key).copied() };
        let Some(route) = route else {
            let known_terminated = self.state.lock().terminated.contains(&key);
            if known_terminated || frame.frame_type == FrameType::Err {
                return;
            }
            self.state.lock().terminated.insert(key);
            self.send_to(
                sender,
                Frame::err(id, ErrorCode::UnknownRequest, "continuation for unknown request"),
            )
            .await;
            return;
        };

        let target = if sender == route.source {
            route.dest
        } else if sender == route.dest {
            route.source
        } else {
            warn!(%id, %sender, "continuation from a party outside the route");
            self.send_to(
                sender,
                Frame::err(id, ErrorCode::ProtocolError, "frame from outside the route"),
            )
            .await;
            return;
        };

        // terminal bookkeeping: the responder's END/ERR completes the
        // request; the requester's ERR cancels it; the requester's END
        // only closes the argument side, so the entry survives for the
        // response to flow back
        if frame.frame_type.is_terminal() {
            let completes = sender == route.dest
                || (frame.frame_type == FrameType::Err && sender == route.source);
            if completes {
                let mut state = self.state.lock();
                state.routes.remove(&key);
                state.terminated.insert(key);
            }
        }

        self.send_to(target, frame).await;
    }

    /// Start a lazily registered endpoint: spawn the process, handshake
    /// over its stdio, adopt its manifest. Any failure poisons the
    /// endpoint permanently.
    async fn spawn_endpoint(&mut self, id: EndpointId) -> Result<(), String> {
        let poison = |state: &Arc<Mutex<HostState>>| {
            let mut state = state.lock();
            if let Some(endpoint) = state.endpoints.get_mut(id) {
                endpoint.state = EndpointState::Poisoned;
            }
            state.rebuild_cap_table();
        };

        let path = {
            let state = self.state.lock();
            match state.endpoints.get(id).and_then(|e| e.path.clone()) {
                Some(path) => path,
                None => return Err("endpoint has no spawn path".to_string()),
            }
        };

        let manifest_bytes = self
            .current_aggregate_manifest()
            .to_bytes()
            .unwrap_or_default();

        info!(endpoint = id, path = %path.display(), "spawning plugin");
        let mut child = match Command::new(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                poison(&self.state);
                return Err(format!("spawning {}: {e}", path.display()));
            }
        };

        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take())
        else {
            poison(&self.state);
            return Err("spawned plugin has no piped stdio".to_string());
        };

        let outcome = match handshake::initiate(
            &mut stdout,
            &mut stdin,
            manifest_bytes,
            self.limits,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = child.start_kill();
                poison(&self.state);
                return Err(format!("handshake with {}: {e}", path.display()));
            }
        };
        let manifest = match Manifest::from_bytes(&outcome.peer_manifest) {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = child.start_kill();
                poison(&self.state);
                return Err(format!("manifest from {}: {e}", path.display()));
            }
        };
        let limits = outcome.limits;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        {
            let mut state = self.state.lock();
            if let Some(endpoint) = state.endpoints.get_mut(id) {
                endpoint.state = EndpointState::Running;
                endpoint.manifest = Some(manifest);
                endpoint.limits = Some(limits);
                endpoint.writer = Some(writer_tx);
                endpoint.child = Some(child);
            }
            state.rebuild_cap_table();
        }

        tokio::spawn(writer_pump(stdin, limits, writer_rx));
        tokio::spawn(endpoint_reader(
            id,
            stdout,
            limits.max_frame,
            self.events_tx.clone(),
        ));
        Ok(())
    }

    /// An endpoint's reader saw EOF or an error: mark it dead, kill its
    /// process, rebuild the tables, and cascade ERR `ENDPOINT_DIED` onto
    /// every in-flight request that touched it.
    async fn on_endpoint_death(&mut self, id: EndpointId) {
        let (name, child, broken_routes) = {
            let mut state = self.state.lock();
            let Some(endpoint) = state.endpoints.get_mut(id) else {
                return;
            };
            if endpoint.state == EndpointState::Dead {
                return;
            }
            endpoint.state = EndpointState::Dead;
            endpoint.writer = None;
            let name = endpoint.name.clone();
            let child = endpoint.child.take();
            state.rebuild_cap_table();

            let me = EndpointRef::Plugin(id);
            let broken: Vec<RouteEntry> = state
                .routes
                .values()
                .filter(|route| route.source == me || route.dest == me)
                .copied()
                .collect();
            for route in &broken {
                let key = route.id.to_canonical();
                state.routes.remove(&key);
                state.terminated.insert(key);
            }
            (name, child, broken)
        };

        warn!(endpoint = id, %name, in_flight = broken_routes.len(), "endpoint died");
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }

        let me = EndpointRef::Plugin(id);
        for route in broken_routes {
            let other = if route.source == me {
                route.dest
            } else {
                route.source
            };
            if other == me {
                continue;
            }
            self.send_to(
                other,
                Frame::err(
                    route.id,
                    ErrorCode::EndpointDied,
                    format!("endpoint {name} died mid-request"),
                ),
            )
            .await;
        }

        self.notify_upstream().await;
    }

    /// Kill every remaining child on shutdown.
    fn shutdown(&mut self) {
        let mut state = self.state.lock();
        for endpoint in state.endpoints.iter_mut() {
            endpoint.writer = None;
            if let Some(mut child) = endpoint.child.take() {
                let _ = child.start_kill();
            }
        }
    }
}

fn serde_manifest_json(manifest: &Manifest) -> Option<String> {
    manifest
        .to_bytes()
        .ok()
        .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
}

/// One writer pump per transport: the sole writer, draining a bounded
/// queue so frames stay atomic on the wire.
async fn writer_pump<W>(mut writer: W, limits: Limits, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, limits.max_frame).await {
            warn!(error = %e, "writer pump stopped");
            break;
        }
    }
}

/// One reader task per endpoint transport, feeding the main loop.
async fn endpoint_reader<R>(
    endpoint: EndpointId,
    mut reader: R,
    max_frame: u32,
    events: mpsc::Sender<Event>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader, max_frame).await {
            Ok(Some(frame)) => {
                if events.send(Event::Frame { endpoint, frame }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(endpoint, error = %e, "endpoint transport failure");
                break;
            }
        }
    }
    let _ = events.send(Event::Closed { endpoint }).await;
}

#[cfg(test)]
mod _send_probe {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[allow(dead_code, unreachable_code)]
    fn probe_run(host: &'static PluginHost) {
        let r: tokio::io::Empty = unimplemented!();
        let w: tokio::io::Sink = unimplemented!();
        assert_send(&host.run(r, w));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_send_to(sw: &'static Switch) {
        assert_send(&sw.send_to(EndpointRef::Engine, unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_on_engine_frame(sw: &'static mut Switch) {
        assert_send(&sw.on_engine_frame(unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_route_request(sw: &'static mut Switch) {
        assert_send(&sw.route_request(EndpointRef::Engine, unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_route_continuation(sw: &'static mut Switch) {
        assert_send(&sw.route_continuation(EndpointRef::Engine, unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_notify_upstream(sw: &'static Switch) {
        assert_send(&sw.notify_upstream());
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_spawn_endpoint(sw: &'static mut Switch) {
        assert_send(&sw.spawn_endpoint(unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_on_endpoint_death(sw: &'static mut Switch) {
        assert_send(&sw.on_endpoint_death(unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_on_relay_notify(sw: &'static mut Switch) {
        assert_send(&sw.on_relay_notify(unimplemented!(), unimplemented!()));
    }

    #[allow(dead_code, unreachable_code)]
    fn probe_on_endpoint_frame(sw: &'static mut Switch) {
        assert_send(&sw.on_endpoint_frame(unimplemented!(), unimplemented!()));
    }
}
