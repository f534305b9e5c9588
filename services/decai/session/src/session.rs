//! Peer session: one negotiated stream bound to one outbound queue and one
//! inbound dispatcher.

use decai_wire::{PeerId, DEFAULT_PROTOCOL_ID, MAX_FRAME_SIZE};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchSummary, EnvelopeHandler, InboundDispatcher};
use crate::handshake::negotiate;
use crate::transport::PeerStream;
use crate::{OutboundQueue, SessionError};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity announced during negotiation
    pub local_peer: PeerId,
    /// Application protocol spoken on the stream
    pub protocol: String,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl SessionConfig {
    /// Config with default protocol and frame limit
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            protocol: DEFAULT_PROTOCOL_ID.to_string(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Lifecycle events emitted by sessions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Negotiation succeeded and the session is running
    Connected {
        /// Remote peer
        peer: PeerId,
        /// Outbound queue bound to the new stream
        queue: OutboundQueue,
    },
    /// The inbound side closed
    Disconnected {
        /// Remote peer
        peer: PeerId,
        /// Error that closed the stream, if any
        error: Option<String>,
    },
}

/// A running session
pub struct PeerSession {
    peer: PeerId,
    queue: OutboundQueue,
    task: JoinHandle<Result<DispatchSummary, SessionError>>,
}

impl PeerSession {
    /// Negotiate on `stream`, then start its writer task and dispatch loop.
    ///
    /// Inbound envelopes go to `handler`; replies pushed through the handler
    /// context travel back on the same stream.
    pub async fn start<S, H>(
        config: &SessionConfig,
        mut stream: S,
        handler: Arc<H>,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Self, SessionError>
    where
        S: PeerStream,
        H: EnvelopeHandler + ?Sized,
    {
        let negotiated = negotiate(&mut stream, &config.protocol, &config.local_peer).await?;
        let peer = negotiated.remote_peer;

        let (reader, writer) = tokio::io::split(stream);
        let (queue, writer_task) = OutboundQueue::spawn(writer, config.max_frame_size);

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(summary)) => debug!(
                    "Writer for {} finished after {} frames",
                    writer_peer, summary.frames
                ),
                Ok(Err(e)) => warn!("Writer for {} stopped: {}", writer_peer, e),
                Err(e) => warn!("Writer task for {} aborted: {}", writer_peer, e),
            }
        });

        info!("Session with {} started", peer);
        if let Some(events) = &events {
            let _ = events.send(SessionEvent::Connected {
                peer: peer.clone(),
                queue: queue.clone(),
            });
        }

        let mut dispatcher = InboundDispatcher::new(peer.clone(), config.max_frame_size);
        let reply = queue.clone();
        let task_peer = peer.clone();
        let task = tokio::spawn(async move {
            let result = dispatcher
                .run(reader, negotiated.leftover, handler, reply)
                .await;

            info!("Session with {} closed", task_peer);
            if let Some(events) = events {
                let _ = events.send(SessionEvent::Disconnected {
                    peer: task_peer,
                    error: result.as_ref().err().map(|e| e.to_string()),
                });
            }
            result
        });

        Ok(Self { peer, queue, task })
    }

    /// Remote peer
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Outbound queue for this stream
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Half-close the outbound direction once queued frames are written
    pub fn close(&self) {
        self.queue.close();
    }

    /// Wait for the inbound side to close
    pub async fn closed(self) -> Result<DispatchSummary, SessionError> {
        drop(self.queue);
        self.task
            .await
            .map_err(|e| SessionError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::InboundContext;
    use bytes::Bytes;
    use decai_wire::{DataRef, Envelope, InferenceOutput, InferenceRequest, ModelRef};

    fn request(task_id: &str) -> Envelope {
        InferenceRequest {
            task_id: task_id.to_string(),
            input: DataRef::Inline(Bytes::from_static(b"{\"input_data\":[[0.1]]}")),
            model: ModelRef::Id("mnist".to_string()),
            srs: DataRef::Inline(Bytes::from_static(b"srs")),
            invoice_fulfilled: None,
        }
        .into()
    }

    #[tokio::test]
    async fn test_request_reply_over_one_stream() {
        let (client_io, server_io) = tokio::io::duplex(8 * 1024);

        // Server echoes every request back as an output with the same task id
        let server_handler = |envelope: Envelope, ctx: InboundContext| async move {
            if let Envelope::InferenceRequest(request) = envelope {
                ctx.reply.push(
                    InferenceOutput {
                        task_id: request.task_id,
                        witness: request.input,
                        proof: DataRef::Inline(Bytes::from_static(b"proof")),
                        verifying_key: DataRef::Inline(Bytes::from_static(b"vk")),
                    }
                    .into(),
                )?;
            }
            Ok::<(), anyhow::Error>(())
        };

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let client_handler = move |envelope: Envelope, ctx: InboundContext| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send((ctx.peer, envelope))?;
                Ok::<(), anyhow::Error>(())
            }
        };

        let server_config = SessionConfig::new(PeerId::from("server"));
        let client_config = SessionConfig::new(PeerId::from("client"));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let server = tokio::spawn(async move {
            PeerSession::start(&server_config, server_io, Arc::new(server_handler), Some(events_tx))
                .await
                .unwrap()
        });
        let client = PeerSession::start(&client_config, client_io, Arc::new(client_handler), None)
            .await
            .unwrap();
        let server = server.await.unwrap();

        assert_eq!(client.peer(), &PeerId::from("server"));
        assert_eq!(server.peer(), &PeerId::from("client"));
        match events_rx.recv().await.unwrap() {
            SessionEvent::Connected { peer, .. } => assert_eq!(peer, PeerId::from("client")),
            other => panic!("expected Connected, got {:?}", other),
        }

        client.queue().push(request("task-1")).unwrap();
        client.queue().push(request("task-2")).unwrap();

        let (from, first) = seen_rx.recv().await.unwrap();
        assert_eq!(from, PeerId::from("server"));
        assert_eq!(first.task_id(), Some("task-1"));
        let (_, second) = seen_rx.recv().await.unwrap();
        assert_eq!(second.task_id(), Some("task-2"));

        // Closing the client's queue half-closes the stream; the server sees EOF
        client.close();
        let summary = server.closed().await.unwrap();
        assert_eq!(summary.dispatched, 2);
        match events_rx.recv().await.unwrap() {
            SessionEvent::Disconnected { peer, error } => {
                assert_eq!(peer, PeerId::from("client"));
                assert!(error.is_none());
            }
            other => panic!("expected Disconnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_protocol_is_refused() {
        let (a, b) = tokio::io::duplex(1024);
        let mut other = SessionConfig::new(PeerId::from("b"));
        other.protocol = "/decai/inference/2.0.0".to_string();

        let handler = |_: Envelope, _: InboundContext| async { Ok::<(), anyhow::Error>(()) };
        let handler = Arc::new(handler);

        let remote = tokio::spawn({
            let handler = handler.clone();
            async move { PeerSession::start(&other, b, handler, None).await.map(|_| ()) }
        });
        let result = PeerSession::start(&SessionConfig::new(PeerId::from("a")), a, handler, None).await;

        assert!(matches!(result, Err(SessionError::ProtocolMismatch { .. })));
        assert!(remote.await.unwrap().is_err());
    }
}
