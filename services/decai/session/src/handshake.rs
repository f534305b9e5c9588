//! Protocol negotiation for peer streams.
//!
//! Immediately after a stream opens, each side writes two frames: the
//! protocol identifier it speaks and its peer id. Both sides then read the
//! other's frames and refuse the stream if the protocols differ.

use bytes::{Bytes, BytesMut};
use decai_wire::{encode_frame, FrameDecoder, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::SessionError;

/// Upper bound for negotiation frames
pub const MAX_NEGOTIATION_FRAME: usize = 1024;

/// Outcome of a successful negotiation
#[derive(Debug)]
pub struct Negotiated {
    /// Peer id announced by the remote side
    pub remote_peer: PeerId,
    /// Bytes read past the negotiation frames; they belong to the envelope stream
    pub leftover: BytesMut,
}

/// Read the next frame from `reader`, buffering in `buffer`.
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Option<Bytes>, SessionError> {
    loop {
        if let Some(frame) = decoder.decode(buffer)? {
            return Ok(Some(frame));
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Ok(decoder.decode_eof(buffer)?);
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Announce `protocol` and `local_peer`, then check what the peer announced
pub async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    protocol: &str,
    local_peer: &PeerId,
) -> Result<Negotiated, SessionError> {
    let mut hello = BytesMut::new();
    hello.extend_from_slice(&encode_frame(protocol.as_bytes(), MAX_NEGOTIATION_FRAME)?);
    hello.extend_from_slice(&encode_frame(local_peer.as_str().as_bytes(), MAX_NEGOTIATION_FRAME)?);
    stream.write_all(&hello).await?;
    stream.flush().await?;
    debug!("Offered protocol {} as {}", protocol, local_peer);

    let mut decoder = FrameDecoder::with_max_frame_size(MAX_NEGOTIATION_FRAME);
    let mut buffer = BytesMut::with_capacity(4 * 1024);

    let offered = read_frame(stream, &mut decoder, &mut buffer)
        .await?
        .ok_or(SessionError::NegotiationEof)?;
    let offered = String::from_utf8_lossy(&offered).into_owned();
    if offered != protocol {
        return Err(SessionError::ProtocolMismatch {
            expected: protocol.to_string(),
            actual: offered,
        });
    }

    let remote_peer = read_frame(stream, &mut decoder, &mut buffer)
        .await?
        .ok_or(SessionError::NegotiationEof)?;
    let remote_peer = PeerId::new(String::from_utf8_lossy(&remote_peer).into_owned());
    debug!("Negotiated {} with peer {}", protocol, remote_peer);

    Ok(Negotiated {
        remote_peer,
        leftover: buffer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use decai_wire::MAX_FRAME_SIZE;

    #[tokio::test]
    async fn test_negotiation_exchanges_peer_ids() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let proto = "/decai/inference/1.0.0";

        let side_b = tokio::spawn(async move {
            let negotiated = negotiate(&mut b, proto, &PeerId::from("server")).await.unwrap();
            negotiated.remote_peer
        });

        let negotiated = negotiate(&mut a, proto, &PeerId::from("client")).await.unwrap();
        assert_eq!(negotiated.remote_peer, PeerId::from("server"));
        assert_eq!(side_b.await.unwrap(), PeerId::from("client"));
    }

    #[tokio::test]
    async fn test_negotiation_rejects_other_protocol() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = negotiate(&mut b, "/other/1.0.0", &PeerId::from("b")).await;
        });

        match negotiate(&mut a, "/decai/inference/1.0.0", &PeerId::from("a")).await {
            Err(SessionError::ProtocolMismatch { expected, actual }) => {
                assert_eq!(expected, "/decai/inference/1.0.0");
                assert_eq!(actual, "/other/1.0.0");
            }
            other => panic!("expected protocol mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_negotiation_keeps_early_frames() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let proto = "/decai/inference/1.0.0";

        // Peer pipelines an application frame right behind its hello
        let mut early = BytesMut::new();
        early.extend_from_slice(&encode_frame(proto.as_bytes(), MAX_FRAME_SIZE).unwrap());
        early.extend_from_slice(&encode_frame(b"peer-b", MAX_FRAME_SIZE).unwrap());
        early.extend_from_slice(&encode_frame(b"payload", MAX_FRAME_SIZE).unwrap());
        b.write_all(&early).await.unwrap();

        let mut negotiated = negotiate(&mut a, proto, &PeerId::from("a")).await.unwrap();
        assert_eq!(negotiated.remote_peer, PeerId::from("peer-b"));

        let mut decoder = FrameDecoder::new();
        let frame = decoder.decode(&mut negotiated.leftover).unwrap().unwrap();
        assert_eq!(&frame[..], b"payload");
    }

    #[tokio::test]
    async fn test_negotiation_eof() {
        let (mut a, b) = tokio::io::duplex(4096);
        drop(b);

        let result = negotiate(&mut a, "/decai/inference/1.0.0", &PeerId::from("a")).await;
        assert!(result.is_err());
    }
}
