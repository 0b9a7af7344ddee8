//! The plugin-side event loop.
//!
//! One dispatcher task owns the transport reader; a writer-guardian task
//! owns the writer and drains a bounded outbound queue, so frames are
//! atomic on the wire without any emitter ever holding the writer. Each
//! REQ spawns a concurrent handler task; the dispatcher buffers that
//! request's input frames, enforcing the per-stream state machine, and
//! hands them to the handler's bounded channel when the request's END
//! arrives. Heartbeats are echoed through a separate priority queue so
//! they never wait behind handler output.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use capns_urn::CapUrn;
use capns_wire::{
    fnv1a_64, handshake, read_frame, write_frame, ErrorCode, Frame, FrameType, Limits, Manifest,
    ManifestError, RecentIds, WireError,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::handler::{AlreadyRegistered, FnHandler, Handler, HandlerRegistry, Request};
use crate::peer::{PeerTable, PendingPeer};
use crate::{Emitter, HandlerFailure, PeerInvoker};

/// Capacity of each handler's inbound frame channel.
pub const HANDLER_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the writer guardian's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// How many terminated message ids are remembered so late frames for a
/// cancelled or finished request can be dropped silently.
const TERMINATED_MEMORY: usize = 1024;

/// Fatal errors that stop [`PluginRuntime::run`].
#[derive(Debug)]
pub enum RuntimeError {
    /// Transport-integrity failure: decode error, oversize frame,
    /// handshake violation.
    Wire(WireError),
    /// The runtime's own manifest does not serialize or validate.
    Manifest(ManifestError),
    /// A relay frame reached the plugin runtime. Relay frames are private
    /// to the relay pair; seeing one here means the transport is wired
    /// wrong, so it is torn down.
    RelayFrame(FrameType),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Wire(e) => write!(f, "transport failure: {e}"),
            RuntimeError::Manifest(e) => write!(f, "manifest error: {e}"),
            RuntimeError::RelayFrame(t) => {
                write!(f, "relay frame {t} must never reach a plugin runtime")
            }
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Wire(e) => Some(e),
            RuntimeError::Manifest(e) => Some(e),
            RuntimeError::RelayFrame(_) => None,
        }
    }
}

impl From<WireError> for RuntimeError {
    fn from(e: WireError) -> Self {
        RuntimeError::Wire(e)
    }
}

/// Per-stream bookkeeping for an inbound request.
struct StreamInfo {
    id: String,
    chunks: u64,
    closed: bool,
}

/// Per-request bookkeeping between REQ and the handler's terminal frame.
struct IncomingEntry {
    /// Sender half of the handler's frame channel; taken on END delivery.
    handler_tx: Option<mpsc::Sender<Frame>>,
    /// Frames accumulated until the request's END arrives.
    buffered: Vec<Frame>,
    streams: Vec<StreamInfo>,
    /// Set when the request's END has been seen.
    ended: bool,
}

type IncomingTable = Arc<Mutex<HashMap<String, IncomingEntry>>>;

/// The per-plugin-process runtime: handler registry plus the event loop.
///
/// ```no_run
/// use capns_runtime::{PluginRuntime, HandlerFailure};
/// use capns_wire::Manifest;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let mut runtime = PluginRuntime::new(Manifest::new("demo", "1.0.0"));
/// runtime.register_fn("cap:op=echo".parse()?, |mut req, out, _peer| async move {
///     let args = req.collect_args().await;
///     for (_media, value) in args {
///         out.emit_value(value).await.map_err(|e| HandlerFailure::new(e.to_string()))?;
///     }
///     Ok(())
/// })?;
/// runtime.run(tokio::io::stdin(), tokio::io::stdout()).await?;
/// # Ok(())
/// # }
/// ```
pub struct PluginRuntime {
    manifest: Manifest,
    handlers: HandlerRegistry,
    proposed: Limits,
}

impl PluginRuntime {
    pub fn new(manifest: Manifest) -> Self {
        PluginRuntime {
            manifest,
            handlers: HandlerRegistry::new(),
            proposed: Limits::default(),
        }
    }

    /// Override the limits proposed during the handshake.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.proposed = limits;
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Install a handler for a cap URN.
    pub fn register(
        &mut self,
        urn: CapUrn,
        handler: impl Handler + 'static,
    ) -> Result<(), AlreadyRegistered> {
        self.handlers.register(urn, Arc::new(handler))
    }

    /// Install a pre-wrapped handler.
    pub fn register_arc(
        &mut self,
        urn: CapUrn,
        handler: Arc<dyn Handler>,
    ) -> Result<(), AlreadyRegistered> {
        self.handlers.register(urn, handler)
    }

    /// Install an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, urn: CapUrn, f: F) -> Result<(), AlreadyRegistered>
    where
        F: Fn(Request, Emitter, PeerInvoker) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerFailure>> + Send + 'static,
    {
        self.handlers.register(urn, Arc::new(FnHandler(f)))
    }

    /// Drive the event loop until the peer closes the transport.
    ///
    /// Performs the responder side of the handshake, then dispatches until
    /// clean EOF; in-flight handlers run to completion before this returns.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> Result<(), RuntimeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let manifest_bytes = self.manifest.to_bytes().map_err(RuntimeError::Manifest)?;
        let outcome =
            handshake::accept(&mut reader, &mut writer, manifest_bytes, self.proposed).await?;
        let limits = outcome.limits;
        debug!(%limits, plugin = %self.manifest.name, "plugin handshake complete");

        let (data_tx, data_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (prio_tx, prio_rx) = mpsc::channel(8);
        let writer_task = tokio::spawn(writer_guardian(writer, limits, data_rx, prio_rx));

        let dispatcher = Dispatcher {
            handlers: Arc::new(self.handlers),
            manifest: Arc::new(self.manifest),
            limits,
            out: data_tx,
            prio: prio_tx,
            incoming: Arc::new(Mutex::new(HashMap::new())),
            pending_peers: Arc::new(Mutex::new(HashMap::new())),
            terminated: Arc::new(Mutex::new(RecentIds::new(TERMINATED_MEMORY))),
            tasks: JoinSet::new(),
        };

        match dispatcher.run(&mut reader).await {
            Ok(()) => {
                // all senders are gone; let the guardian drain and exit
                let _ = writer_task.await;
                Ok(())
            }
            Err(e) => {
                writer_task.abort();
                Err(e)
            }
        }
    }
}

/// The single task that owns the transport writer. Two queues: heartbeat
/// echoes preempt data frames.
async fn writer_guardian<W>(
    mut writer: W,
    limits: Limits,
    mut data_rx: mpsc::Receiver<Frame>,
    mut prio_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = prio_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            else => break,
        };
        if let Err(e) = write_frame(&mut writer, &frame, limits.max_frame).await {
            warn!(error = %e, "writer guardian stopped");
            break;
        }
    }
}

struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    manifest: Arc<Manifest>,
    limits: Limits,
    out: mpsc::Sender<Frame>,
    prio: mpsc::Sender<Frame>,
    incoming: IncomingTable,
    pending_peers: PeerTable,
    terminated: Arc<Mutex<RecentIds>>,
    tasks: JoinSet<()>,
}

/// What to do with a continuation frame, decided under the table lock and
/// performed after it is released.
enum Continuation {
    /// Append to the request's buffer (already done under the lock).
    Buffered,
    /// The request's END arrived: deliver the buffer then close the
    /// handler channel.
    Deliver {
        tx: mpsc::Sender<Frame>,
        frames: Vec<Frame>,
        end: Frame,
    },
    /// Protocol violation: answer ERR and tear the request down.
    Violation(String),
    /// Inbound ERR: tear down without answering.
    Cancelled,
    /// Late frame for a terminated id; drop without error.
    DropSilent,
    /// No state anywhere for this id.
    Unknown,
}

impl Dispatcher {
    async fn run<R>(mut self, reader: &mut R) -> Result<(), RuntimeError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match read_frame(reader, self.limits.max_frame).await {
                Ok(Some(frame)) => self.on_frame(frame).await?,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "transport integrity failure, closing");
                    return Err(RuntimeError::Wire(e));
                }
            }
        }
        debug!("reader at EOF, awaiting in-flight handlers");
        while self.tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn send(&self, frame: Frame) {
        // a dead writer surfaces as EOF on the reader soon enough
        let _ = self.out.send(frame).await;
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), RuntimeError> {
        match frame.frame_type {
            FrameType::RelayNotify | FrameType::RelayState => {
                error!(frame_type = %frame.frame_type, "relay frame inside plugin runtime");
                Err(RuntimeError::RelayFrame(frame.frame_type))
            }
            FrameType::Hello => {
                warn!("HELLO after handshake");
                self.send(Frame::err(
                    frame.id,
                    ErrorCode::ProtocolError,
                    "HELLO after handshake",
                ))
                .await;
                Ok(())
            }
            FrameType::Heartbeat => {
                // answered synchronously, never behind handler dispatch
                let _ = self.prio.send(Frame::heartbeat(frame.id)).await;
                Ok(())
            }
            FrameType::Req => {
                self.on_req(frame).await;
                Ok(())
            }
            FrameType::Log => {
                self.on_log(frame).await;
                Ok(())
            }
            FrameType::StreamStart
            | FrameType::Chunk
            | FrameType::StreamEnd
            | FrameType::End
            | FrameType::Err => {
                self.on_continuation(frame).await;
                Ok(())
            }
        }
    }

    async fn on_log(&self, frame: Frame) {
        let key = frame.id.to_canonical();
        let tx = {
            let peers = self.pending_peers.lock();
            peers.get(&key).filter(|p| !p.ended).map(|p| p.tx.clone())
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(frame).await;
            }
            None => {
                debug!(
                    id = %frame.id,
                    message = frame.err_message().unwrap_or(""),
                    "log frame"
                );
            }
        }
    }

    async fn on_req(&mut self, frame: Frame) {
        let id = frame.id;
        let key = id.to_canonical();

        // at most one REQ per id; a duplicate is a violation that tears
        // down whatever state the id had
        let already_known = self.incoming.lock().contains_key(&key)
            || self.pending_peers.lock().contains_key(&key)
            || self.terminated.lock().contains(&key);
        if already_known {
            self.teardown(&key);
            self.send(Frame::err(id, ErrorCode::ProtocolError, "duplicate REQ"))
                .await;
            return;
        }

        if frame.has_forbidden_payload() {
            self.terminated.lock().insert(key);
            self.send(Frame::err(
                id,
                ErrorCode::ProtocolError,
                "REQ payload must be empty",
            ))
            .await;
            return;
        }

        let cap: CapUrn = match frame.cap.as_deref().unwrap_or_default().parse() {
            Ok(cap) => cap,
            Err(e) => {
                self.terminated.lock().insert(key);
                self.send(Frame::err(
                    id,
                    ErrorCode::InvalidRequest,
                    format!("malformed cap URN: {e}"),
                ))
                .await;
                return;
            }
        };

        let Some(handler) = self.handlers.lookup(&cap).cloned() else {
            self.terminated.lock().insert(key);
            self.send(Frame::err(
                id,
                ErrorCode::NoHandler,
                format!("no handler accepts {cap}"),
            ))
            .await;
            return;
        };

        debug!(%id, %cap, "dispatching request");
        let (handler_tx, handler_rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
        self.incoming.lock().insert(
            key.clone(),
            IncomingEntry {
                handler_tx: Some(handler_tx),
                buffered: Vec::new(),
                streams: Vec::new(),
                ended: false,
            },
        );

        let emitter = Emitter::new(
            id,
            self.out.clone(),
            self.limits.max_chunk as usize,
            self.response_media_urn(&cap),
        );
        let peer = PeerInvoker::new(self.out.clone(), self.pending_peers.clone(), self.limits);
        let request = Request {
            id,
            cap,
            frames: handler_rx,
        };

        let task_emitter = emitter.clone();
        let inner: JoinHandle<Result<(), HandlerFailure>> =
            tokio::spawn(async move { handler.handle(request, task_emitter, peer).await });

        let incoming = self.incoming.clone();
        let terminated = self.terminated.clone();
        self.tasks.spawn(async move {
            finish_handler(inner, emitter, incoming, terminated, key).await;
        });
    }

    /// The declared output media URN for a request: the manifest entry
    /// whose URN matches (exactly, then by `accepts`), else binary.
    fn response_media_urn(&self, cap: &CapUrn) -> String {
        let decl = self
            .manifest
            .find_cap(cap)
            .or_else(|| self.manifest.caps.iter().find(|c| c.urn.accepts(cap)));
        decl.and_then(|c| c.output.as_ref())
            .map(|o| o.media_urn.to_string())
            .unwrap_or_else(|| "media:binary".to_string())
    }

    /// Remove all state for an id (cancellation or violation teardown).
    fn teardown(&self, key: &str) {
        self.incoming.lock().remove(key);
        self.pending_peers.lock().remove(key);
        self.terminated.lock().insert(key.to_string());
    }

    async fn on_continuation(&mut self, frame: Frame) {
        let id = frame.id;
        let key = id.to_canonical();

        if let Some(route) = self.route_to_peer(&key, &frame) {
            match route {
                PeerRoute::Forward(tx) => {
                    let _ = tx.send(frame).await;
                }
                PeerRoute::Terminal(entry) => {
                    let _ = entry.tx.send(frame).await;
                    self.terminated.lock().insert(key);
                }
                PeerRoute::Drop => {}
            }
            return;
        }

        let action = self.incoming_action(&key, frame);
        match action {
            Continuation::Buffered => {}
            Continuation::Deliver { tx, frames, end } => {
                for buffered in frames {
                    let _ = tx.send(buffered).await;
                }
                let _ = tx.send(end).await;
                // dropping `tx` closes the handler's channel
            }
            Continuation::Violation(message) => {
                warn!(%id, %message, "stream state violation");
                self.teardown(&key);
                self.send(Frame::err(id, ErrorCode::ProtocolError, message))
                    .await;
            }
            Continuation::Cancelled => {
                debug!(%id, "request cancelled by peer");
                self.teardown(&key);
            }
            Continuation::DropSilent => {}
            Continuation::Unknown => {
                self.terminated.lock().insert(key);
                self.send(Frame::err(
                    id,
                    ErrorCode::UnknownRequest,
                    "continuation for unknown request",
                ))
                .await;
            }
        }
    }

    /// If this id belongs to an outstanding peer invocation, decide its
    /// routing under the table lock.
    fn route_to_peer(&self, key: &str, frame: &Frame) -> Option<PeerRoute> {
        let mut peers = self.pending_peers.lock();
        if peers.get(key).is_some_and(|entry| entry.ended) {
            return Some(PeerRoute::Drop);
        }
        if frame.frame_type.is_terminal() {
            let mut entry = peers.remove(key)?;
            entry.ended = true;
            return Some(PeerRoute::Terminal(entry));
        }
        let entry = peers.get_mut(key)?;
        match frame.frame_type {
            FrameType::StreamStart => {
                if let Some(stream_id) = &frame.stream_id {
                    entry.open_streams.insert(stream_id.clone());
                }
            }
            FrameType::StreamEnd => {
                if let Some(stream_id) = &frame.stream_id {
                    entry.open_streams.remove(stream_id);
                }
            }
            _ => {}
        }
        Some(PeerRoute::Forward(entry.tx.clone()))
    }

    /// Run the inbound stream state machine for one frame, under the
    /// incoming-table lock.
    fn incoming_action(&self, key: &str, frame: Frame) -> Continuation {
        let mut incoming = self.incoming.lock();
        let Some(entry) = incoming.get_mut(key) else {
            drop(incoming);
            if self.terminated.lock().contains(key) {
                return Continuation::DropSilent;
            }
            if frame.frame_type == FrameType::Err {
                // tearing down a request we never knew is a no-op
                return Continuation::DropSilent;
            }
            return Continuation::Unknown;
        };

        match frame.frame_type {
            FrameType::Err => return Continuation::Cancelled,
            FrameType::End => {
                if entry.ended {
                    return Continuation::Violation("duplicate END".to_string());
                }
                entry.ended = true;
                let Some(tx) = entry.handler_tx.take() else {
                    return Continuation::Violation("request has no handler channel".to_string());
                };
                let frames = std::mem::take(&mut entry.buffered);
                return Continuation::Deliver {
                    tx,
                    frames,
                    end: frame,
                };
            }
            _ => {}
        }

        if entry.ended {
            let message = if frame.frame_type == FrameType::StreamStart {
                "STREAM_START after request END"
            } else {
                "frame after request END"
            };
            return Continuation::Violation(message.to_string());
        }

        match frame.frame_type {
            FrameType::StreamStart => {
                let stream_id = frame.stream_id.clone().unwrap_or_default();
                if entry.streams.iter().any(|s| s.id == stream_id) {
                    return Continuation::Violation(format!("duplicate stream_id {stream_id:?}"));
                }
                entry.streams.push(StreamInfo {
                    id: stream_id,
                    chunks: 0,
                    closed: false,
                });
                entry.buffered.push(frame);
                Continuation::Buffered
            }
            FrameType::Chunk => {
                let stream_id = frame.stream_id.clone().unwrap_or_default();
                let payload_len = frame.payload.as_ref().map(|p| p.len()).unwrap_or(0);
                if payload_len > self.limits.max_chunk as usize {
                    return Continuation::Violation(format!(
                        "CHUNK payload {payload_len} exceeds negotiated max_chunk {}",
                        self.limits.max_chunk
                    ));
                }
                let Some(stream) = entry.streams.iter_mut().find(|s| s.id == stream_id) else {
                    return Continuation::Violation("CHUNK for unknown stream_id".to_string());
                };
                if stream.closed {
                    return Continuation::Violation("CHUNK for ended stream".to_string());
                }
                let expected = stream.chunks;
                if frame.chunk_index != Some(expected) {
                    return Continuation::Violation(format!(
                        "CHUNK integrity failure: index {:?}, expected {expected}",
                        frame.chunk_index
                    ));
                }
                let payload_ok = match (&frame.payload, frame.checksum) {
                    (Some(payload), Some(checksum)) => fnv1a_64(payload) == checksum,
                    _ => false,
                };
                if !payload_ok {
                    return Continuation::Violation(
                        "CHUNK integrity failure: checksum mismatch".to_string(),
                    );
                }
                stream.chunks += 1;
                entry.buffered.push(frame);
                Continuation::Buffered
            }
            FrameType::StreamEnd => {
                let stream_id = frame.stream_id.clone().unwrap_or_default();
                let Some(stream) = entry.streams.iter_mut().find(|s| s.id == stream_id) else {
                    return Continuation::Violation("STREAM_END for unknown stream_id".to_string());
                };
                if stream.closed {
                    return Continuation::Violation("STREAM_END for ended stream".to_string());
                }
                if frame.chunk_count != Some(stream.chunks) {
                    return Continuation::Violation(format!(
                        "STREAM_END count mismatch: declared {:?}, observed {}",
                        frame.chunk_count, stream.chunks
                    ));
                }
                stream.closed = true;
                entry.buffered.push(frame);
                Continuation::Buffered
            }
            // END and ERR were handled above; nothing else reaches here
            _ => Continuation::DropSilent,
        }
    }
}

enum PeerRoute {
    Forward(mpsc::Sender<Frame>),
    Terminal(PendingPeer),
    Drop,
}

/// Await a handler task and produce the request's terminal frames.
async fn finish_handler(
    inner: JoinHandle<Result<(), HandlerFailure>>,
    emitter: Emitter,
    incoming: IncomingTable,
    terminated: Arc<Mutex<RecentIds>>,
    key: String,
) {
    let outcome = inner.await;

    // a request torn down by cancellation or violation must not produce
    // frames anymore
    let still_active = incoming.lock().remove(&key).is_some();
    terminated.lock().insert(key);
    if !still_active {
        return;
    }

    match outcome {
        Ok(Ok(())) => {
            let _ = emitter.finalize().await;
        }
        Ok(Err(failure)) => {
            let _ = emitter.fail(failure.code, failure.message).await;
        }
        Err(join_error) => {
            let message = panic_message(join_error);
            error!(id = %emitter.message_id(), %message, "handler panicked");
            let _ = emitter
                .fail(ErrorCode::HandlerError, format!("handler panicked: {message}"))
                .await;
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    match error.try_into_panic() {
        Ok(panic) => {
            if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_string()
            }
        }
        Err(e) => e.to_string(),
    }
}

