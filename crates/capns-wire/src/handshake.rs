//! Initial capability exchange and limits negotiation.
//!
//! The initiator sends HELLO (manifest bytes + proposed limits); the
//! responder replies with its own HELLO, echoing the initiator's message id.
//! Effective limits are the component-wise minimum of the two proposals.
//! Any other frame before both HELLOs is a protocol violation and the
//! caller must close the transport.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::{read_frame, write_frame, Frame, FrameType, Limits, MessageId, WireError};

/// What a successful handshake yields.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// The peer's manifest bytes, verbatim.
    pub peer_manifest: Bytes,
    /// Negotiated (pairwise-min) limits.
    pub limits: Limits,
}

fn hello_outcome(frame: &Frame, proposed: Limits) -> Result<HandshakeOutcome, WireError> {
    let peer_limits = frame
        .meta
        .as_ref()
        .and_then(Limits::from_meta)
        .ok_or_else(|| WireError::Handshake("HELLO limits are malformed".to_string()))?;
    Ok(HandshakeOutcome {
        peer_manifest: frame.payload.clone().unwrap_or_default(),
        limits: proposed.negotiate(&peer_limits),
    })
}

/// Client side: send HELLO, await the peer's HELLO.
pub async fn initiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    manifest: Bytes,
    proposed: Limits,
) -> Result<HandshakeOutcome, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let id = MessageId::random();
    write_frame(writer, &Frame::hello(id, manifest, proposed), proposed.max_frame).await?;

    let reply = read_frame(reader, proposed.max_frame)
        .await?
        .ok_or_else(|| WireError::Handshake("peer closed during handshake".to_string()))?;
    if reply.frame_type != FrameType::Hello {
        return Err(WireError::Handshake(format!(
            "expected HELLO, got {}",
            reply.frame_type
        )));
    }
    let outcome = hello_outcome(&reply, proposed)?;
    debug!(limits = %outcome.limits, "handshake complete (initiator)");
    Ok(outcome)
}

/// Server side: await the peer's HELLO, reply with our own.
pub async fn accept<R, W>(
    reader: &mut R,
    writer: &mut W,
    manifest: Bytes,
    proposed: Limits,
) -> Result<HandshakeOutcome, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = read_frame(reader, proposed.max_frame)
        .await?
        .ok_or_else(|| WireError::Handshake("peer closed during handshake".to_string()))?;
    if first.frame_type != FrameType::Hello {
        return Err(WireError::Handshake(format!(
            "expected HELLO, got {}",
            first.frame_type
        )));
    }
    let outcome = hello_outcome(&first, proposed)?;

    // reply with the same id so the exchange is self-correlating
    write_frame(writer, &Frame::hello(first.id, manifest, proposed), proposed.max_frame).await?;
    debug!(limits = %outcome.limits, "handshake complete (responder)");
    Ok(outcome)
}
