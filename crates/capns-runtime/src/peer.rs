//! Outbound peer invocation: a handler calling another capability through
//! the host.
//!
//! [`PeerInvoker::invoke`] allocates a fresh message id, emits
//! REQ / STREAM_START / CHUNK* / STREAM_END per argument / END, and
//! registers the id in the pending-peer table. The dispatcher routes the
//! response frames into the returned [`PeerResponse`]'s channel; the
//! terminal frame (END or ERR) closes it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use capns_urn::CapUrn;
use capns_wire::{fnv1a_64, ErrorCode, Frame, FrameType, Limits, MessageId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each peer-response frame channel.
const PEER_CHANNEL_CAPACITY: usize = 64;

/// One argument of a peer invocation.
#[derive(Debug, Clone)]
pub struct PeerArg {
    pub media_urn: String,
    pub value: Bytes,
}

impl PeerArg {
    pub fn new(media_urn: impl Into<String>, value: impl Into<Bytes>) -> Self {
        PeerArg {
            media_urn: media_urn.into(),
            value: value.into(),
        }
    }
}

/// Errors from issuing or consuming a peer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The transport (or runtime) went away.
    Closed,
    /// The callee terminated the request with ERR.
    Remote { code: ErrorCode, message: String },
    /// The response frames violated protocol ordering or integrity.
    Protocol(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Closed => write!(f, "peer channel closed"),
            PeerError::Remote { code, message } => write!(f, "peer error {code}: {message}"),
            PeerError::Protocol(msg) => write!(f, "peer response violation: {msg}"),
        }
    }
}

impl std::error::Error for PeerError {}

/// Book-keeping for one outstanding outbound invocation.
pub(crate) struct PendingPeer {
    pub tx: mpsc::Sender<Frame>,
    /// Streams currently open in the response.
    pub open_streams: HashSet<String>,
    pub ended: bool,
}

/// The pending-peer-request table, keyed by canonical message id.
pub(crate) type PeerTable = Arc<Mutex<HashMap<String, PendingPeer>>>;

/// Value-like handle for issuing peer invocations. Cheap to clone; carries
/// the outbound queue sender, the pending table, and the negotiated limits.
#[derive(Clone)]
pub struct PeerInvoker {
    out: mpsc::Sender<Frame>,
    pending: PeerTable,
    limits: Limits,
}

impl PeerInvoker {
    pub(crate) fn new(out: mpsc::Sender<Frame>, pending: PeerTable, limits: Limits) -> Self {
        PeerInvoker {
            out,
            pending,
            limits,
        }
    }

    /// Invoke `cap` with the given arguments. The returned response's
    /// channel receives the callee's frames until its terminal.
    pub async fn invoke(
        &self,
        cap: &CapUrn,
        args: Vec<PeerArg>,
    ) -> Result<PeerResponse, PeerError> {
        let id = MessageId::random();
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        self.pending.lock().insert(
            id.to_canonical(),
            PendingPeer {
                tx,
                open_streams: HashSet::new(),
                ended: false,
            },
        );
        debug!(%id, %cap, args = args.len(), "peer invoke");

        let result = self.send_request(id, cap, args).await;
        if result.is_err() {
            // the transport died mid-send; nothing will ever answer
            self.pending.lock().remove(&id.to_canonical());
            return Err(PeerError::Closed);
        }
        Ok(PeerResponse { id, rx })
    }

    async fn send_request(
        &self,
        id: MessageId,
        cap: &CapUrn,
        args: Vec<PeerArg>,
    ) -> Result<(), PeerError> {
        let mut seq = 0u64;
        let mut send = async |mut frame: Frame| {
            frame.seq = Some(seq);
            seq += 1;
            self.out.send(frame).await.map_err(|_| PeerError::Closed)
        };

        send(Frame::req(id, cap.to_string())).await?;
        for (index, arg) in args.iter().enumerate() {
            let stream_id = format!("arg-{index}");
            send(Frame::stream_start(id, stream_id.clone(), arg.media_urn.clone())).await?;
            let max_chunk = self.limits.max_chunk as usize;
            let mut chunk_index = 0u64;
            let mut offset = 0;
            loop {
                let end = (offset + max_chunk).min(arg.value.len());
                send(Frame::chunk(
                    id,
                    stream_id.clone(),
                    chunk_index,
                    arg.value.slice(offset..end),
                ))
                .await?;
                chunk_index += 1;
                offset = end;
                if offset >= arg.value.len() {
                    break;
                }
            }
            send(Frame::stream_end(id, stream_id, chunk_index)).await?;
        }
        send(Frame::end(id)).await?;
        Ok(())
    }
}

/// The inbound side of a peer invocation.
pub struct PeerResponse {
    id: MessageId,
    rx: mpsc::Receiver<Frame>,
}

impl PeerResponse {
    pub fn message_id(&self) -> MessageId {
        self.id
    }

    /// The next response frame; `None` after the terminal frame.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Consume the whole response, returning the concatenated payload of
    /// its first stream. Verifies chunk ordering, checksums and the
    /// declared chunk count as it goes.
    pub async fn collect_value(mut self) -> Result<Bytes, PeerError> {
        let mut value: Vec<u8> = Vec::new();
        let mut collecting: Option<String> = None;
        let mut chunks_seen = 0u64;
        let mut saw_end = false;

        while let Some(frame) = self.rx.recv().await {
            match frame.frame_type {
                FrameType::StreamStart => {
                    if collecting.is_none() {
                        collecting = frame.stream_id.clone();
                    }
                }
                FrameType::Chunk => {
                    let (Some(stream_id), Some(payload), Some(index), Some(checksum)) = (
                        frame.stream_id.as_ref(),
                        frame.payload.as_ref(),
                        frame.chunk_index,
                        frame.checksum,
                    ) else {
                        return Err(PeerError::Protocol("malformed CHUNK".to_string()));
                    };
                    if collecting.as_deref() != Some(stream_id.as_str()) {
                        continue;
                    }
                    if index != chunks_seen {
                        return Err(PeerError::Protocol(format!(
                            "CHUNK index {index}, expected {chunks_seen}"
                        )));
                    }
                    if checksum != fnv1a_64(payload) {
                        return Err(PeerError::Protocol("CHUNK checksum mismatch".to_string()));
                    }
                    chunks_seen += 1;
                    value.extend_from_slice(payload);
                }
                FrameType::StreamEnd => {
                    if collecting.as_deref() == frame.stream_id.as_deref()
                        && frame.chunk_count != Some(chunks_seen)
                    {
                        return Err(PeerError::Protocol(format!(
                            "STREAM_END count {:?}, observed {chunks_seen}",
                            frame.chunk_count
                        )));
                    }
                }
                FrameType::End => {
                    saw_end = true;
                }
                FrameType::Err => {
                    return Err(PeerError::Remote {
                        code: frame.err_code().unwrap_or(ErrorCode::ProtocolError),
                        message: frame.err_message().unwrap_or_default().to_string(),
                    });
                }
                _ => {}
            }
        }
        if !saw_end {
            return Err(PeerError::Closed);
        }
        Ok(Bytes::from(value))
    }
}
