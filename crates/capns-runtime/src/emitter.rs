//! The stream emitter handed to handlers for producing output.
//!
//! Values emitted through [`Emitter::emit_value`] share a single response
//! stream: the first value opens it with STREAM_START, every value is
//! fragmented into CHUNKs of at most the negotiated `max_chunk` bytes, and
//! the runtime closes the stream (STREAM_END with the observed chunk count,
//! then END) when the handler returns.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use capns_wire::{ErrorCode, Frame, MessageId};
use tokio::sync::mpsc;

/// Severity for [`Emitter::emit_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outbound queue disappeared underneath the emitter (transport gone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitError;

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbound frame queue is closed")
    }
}

impl std::error::Error for EmitError {}

struct EmitState {
    started: bool,
    chunks: u64,
    seq: u64,
}

struct EmitterInner {
    id: MessageId,
    out: mpsc::Sender<Frame>,
    max_chunk: usize,
    /// Declared media URN of the response stream.
    media_urn: String,
    /// Held across the emission of one value so chunk indices never
    /// interleave between concurrent emitters of the same response.
    state: tokio::sync::Mutex<EmitState>,
}

/// Value-like output handle for one request. Cheap to clone; carries only
/// the message id and a sender into the writer guardian's queue.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
}

/// The runtime-generated id of the single response stream.
const RESPONSE_STREAM_ID: &str = "out-0";

impl Emitter {
    pub(crate) fn new(
        id: MessageId,
        out: mpsc::Sender<Frame>,
        max_chunk: usize,
        media_urn: String,
    ) -> Self {
        Emitter {
            inner: Arc::new(EmitterInner {
                id,
                out,
                max_chunk,
                media_urn,
                state: tokio::sync::Mutex::new(EmitState {
                    started: false,
                    chunks: 0,
                    seq: 0,
                }),
            }),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.inner.id
    }

    /// Emit one value into the response stream, fragmenting it into CHUNKs
    /// of at most `max_chunk` bytes. Opens the stream on first use.
    pub async fn emit_value(&self, value: impl Into<Bytes>) -> Result<(), EmitError> {
        let value = value.into();
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if !state.started {
            state.started = true;
            let mut frame =
                Frame::stream_start(inner.id, RESPONSE_STREAM_ID, inner.media_urn.clone());
            frame.seq = Some(state.seq);
            state.seq += 1;
            inner.out.send(frame).await.map_err(|_| EmitError)?;
        }

        // an empty value still counts as one (empty) chunk so the consumer
        // observes it
        let mut offset = 0;
        loop {
            let end = (offset + inner.max_chunk).min(value.len());
            let mut frame = Frame::chunk(
                inner.id,
                RESPONSE_STREAM_ID,
                state.chunks,
                value.slice(offset..end),
            );
            frame.seq = Some(state.seq);
            state.seq += 1;
            state.chunks += 1;
            inner.out.send(frame).await.map_err(|_| EmitError)?;
            offset = end;
            if offset >= value.len() {
                break;
            }
        }
        Ok(())
    }

    /// Emit a UTF-8 value.
    pub async fn emit_text(&self, text: impl Into<String>) -> Result<(), EmitError> {
        self.emit_value(Bytes::from(text.into())).await
    }

    /// Send a LOG frame. Never affects the response stream.
    pub async fn emit_log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<(), EmitError> {
        let frame = Frame::log(self.inner.id, level.as_str(), message);
        self.inner.out.send(frame).await.map_err(|_| EmitError)
    }

    /// Close the response: STREAM_END (if a stream was opened) then END.
    /// Called by the runtime after the handler returns `Ok`.
    pub(crate) async fn finalize(&self) -> Result<(), EmitError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.started {
            let mut frame = Frame::stream_end(inner.id, RESPONSE_STREAM_ID, state.chunks);
            frame.seq = Some(state.seq);
            state.seq += 1;
            inner.out.send(frame).await.map_err(|_| EmitError)?;
        }
        let mut frame = Frame::end(inner.id);
        frame.seq = Some(state.seq);
        state.seq += 1;
        inner.out.send(frame).await.map_err(|_| EmitError)
    }

    /// Terminate the request with ERR. Called by the runtime on handler
    /// failure or panic.
    pub(crate) async fn fail(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<(), EmitError> {
        let frame = Frame::err(self.inner.id, code, message);
        self.inner.out.send(frame).await.map_err(|_| EmitError)
    }
}
