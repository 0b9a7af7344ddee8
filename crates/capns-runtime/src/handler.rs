//! Handler registration and dispatch.
//!
//! Handlers are keyed by canonical cap URN. Dispatch first tries exact
//! equality, then scans registrations in insertion order for the first
//! pattern that [`accepts`](CapUrn::accepts) the request URN.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use capns_urn::CapUrn;
use capns_wire::{ErrorCode, Frame, FrameType, MessageId};
use tokio::sync::mpsc;

use crate::{Emitter, PeerInvoker};

/// An inbound request as the handler sees it.
///
/// `frames` delivers the request's input streams (STREAM_START, CHUNK,
/// STREAM_END per argument, in arrival order) followed by the END frame;
/// the channel then closes. Frames on this channel have already passed the
/// runtime's ordering and integrity checks.
pub struct Request {
    pub id: MessageId,
    /// The request URN as received.
    pub cap: CapUrn,
    pub frames: mpsc::Receiver<Frame>,
}

impl Request {
    /// Drain the frame channel into whole argument values:
    /// `(media_urn, concatenated chunk payloads)` per input stream, in
    /// arrival order.
    pub async fn collect_args(&mut self) -> Vec<(String, Bytes)> {
        let mut args: Vec<(String, Vec<u8>)> = Vec::new();
        let mut open: HashMap<String, usize> = HashMap::new();
        while let Some(frame) = self.frames.recv().await {
            match frame.frame_type {
                FrameType::StreamStart => {
                    if let (Some(stream_id), Some(media_urn)) = (frame.stream_id, frame.media_urn) {
                        open.insert(stream_id, args.len());
                        args.push((media_urn, Vec::new()));
                    }
                }
                FrameType::Chunk => {
                    if let (Some(stream_id), Some(payload)) = (&frame.stream_id, &frame.payload) {
                        if let Some(&index) = open.get(stream_id) {
                            args[index].1.extend_from_slice(payload);
                        }
                    }
                }
                FrameType::End => break,
                _ => {}
            }
        }
        args.into_iter()
            .map(|(media, bytes)| (media, Bytes::from(bytes)))
            .collect()
    }
}

/// A failure a handler hands back to the runtime, surfaced to the peer as
/// an ERR frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerFailure {
    /// A plain `HANDLER_ERROR` with a description.
    pub fn new(message: impl Into<String>) -> Self {
        HandlerFailure {
            code: ErrorCode::HandlerError,
            message: message.into(),
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        HandlerFailure {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerFailure {}

/// A capability implementation.
///
/// On `Ok(())` the runtime finalizes the response (STREAM_END for the open
/// response stream, then END); on `Err` it sends ERR with the failure's
/// code and message. A panicking handler is contained and reported as
/// `HANDLER_ERROR`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        request: Request,
        out: Emitter,
        peer: PeerInvoker,
    ) -> Result<(), HandlerFailure>;
}

/// Adapter so plain async closures can be registered as handlers.
pub(crate) struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request, Emitter, PeerInvoker) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerFailure>> + Send,
{
    async fn handle(
        &self,
        request: Request,
        out: Emitter,
        peer: PeerInvoker,
    ) -> Result<(), HandlerFailure> {
        (self.0)(request, out, peer).await
    }
}

/// A URN was registered twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyRegistered(pub String);

impl fmt::Display for AlreadyRegistered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap {:?} is already registered", self.0)
    }
}

impl std::error::Error for AlreadyRegistered {}

/// Ordered handler registry keyed by canonical cap URN.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    entries: Vec<(CapUrn, Arc<dyn Handler>)>,
    by_canonical: HashMap<String, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            entries: Vec::new(),
            by_canonical: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        urn: CapUrn,
        handler: Arc<dyn Handler>,
    ) -> Result<(), AlreadyRegistered> {
        let canonical = urn.to_string();
        if self.by_canonical.contains_key(&canonical) {
            return Err(AlreadyRegistered(canonical));
        }
        self.by_canonical.insert(canonical, self.entries.len());
        self.entries.push((urn, handler));
        Ok(())
    }

    /// Exact canonical match first, then the first registered pattern that
    /// accepts the request.
    pub fn lookup(&self, request: &CapUrn) -> Option<&Arc<dyn Handler>> {
        if let Some(&index) = self.by_canonical.get(&request.to_string()) {
            return Some(&self.entries[index].1);
        }
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.accepts(request))
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait]
    impl Handler for NullHandler {
        async fn handle(
            &self,
            _request: Request,
            _out: Emitter,
            _peer: PeerInvoker,
        ) -> Result<(), HandlerFailure> {
            Ok(())
        }
    }

    fn urn(s: &str) -> CapUrn {
        s.parse().unwrap()
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(urn("cap:op=x"), Arc::new(NullHandler)).unwrap();
        let err = registry
            .register(urn("cap:op=x"), Arc::new(NullHandler))
            .unwrap_err();
        assert_eq!(err, AlreadyRegistered("cap:op=x".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_prefers_exact_match() {
        let mut registry = HandlerRegistry::new();
        // a broad pattern registered first would win a pure scan
        registry.register(urn("cap:op=*"), Arc::new(NullHandler)).unwrap();
        registry.register(urn("cap:op=x"), Arc::new(NullHandler)).unwrap();

        // the exact entry is selected even though the scan would stop at
        // the wildcard
        let request = urn("cap:op=x");
        let exact = registry.lookup(&request).unwrap();
        assert!(Arc::ptr_eq(exact, &registry.entries[1].1));
    }

    #[test]
    fn lookup_falls_back_to_first_accepting() {
        let mut registry = HandlerRegistry::new();
        registry.register(urn("cap:op=other"), Arc::new(NullHandler)).unwrap();
        registry.register(urn("cap:op=*"), Arc::new(NullHandler)).unwrap();

        let request = urn("cap:ext=pdf;op=thumb");
        let matched = registry.lookup(&request).unwrap();
        assert!(Arc::ptr_eq(matched, &registry.entries[1].1));
        assert!(registry.lookup(&urn("media:op=thumb")).is_none());
    }
}
