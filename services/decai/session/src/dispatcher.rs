//! Inbound dispatch loop.
//!
//! Reads frames off a stream's read half, decodes each into an envelope and
//! hands it to an [`EnvelopeHandler`] on its own task, so a slow handler
//! never holds up the next read. Frames that fail to decode are logged and
//! skipped. Framing errors end the loop.

use async_trait::async_trait;
use bytes::BytesMut;
use decai_wire::{decode_envelope, Envelope, FrameDecoder, PeerId};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::handshake::read_frame;
use crate::{OutboundQueue, SessionError};

/// What a handler gets alongside each envelope
#[derive(Clone, Debug)]
pub struct InboundContext {
    /// Peer the envelope came from
    pub peer: PeerId,
    /// Queue for replies on the same stream
    pub reply: OutboundQueue,
}

/// Application callback for decoded envelopes
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Handle one envelope. Errors are logged by the dispatcher, never retried.
    async fn handle(&self, envelope: Envelope, ctx: InboundContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for F
where
    F: Fn(Envelope, InboundContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, ctx: InboundContext) -> anyhow::Result<()> {
        (self)(envelope, ctx).await
    }
}

/// Dispatcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for the next complete frame
    Reading,
    /// Unpacking a frame
    Decoding,
    /// Handing an envelope to the handler
    Dispatching,
    /// Stream ended or failed
    Closed,
}

/// Counters reported when a dispatch loop ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Frames read off the stream
    pub frames: u64,
    /// Payload bytes read, prefixes excluded
    pub bytes: u64,
    /// Envelopes handed to the handler
    pub dispatched: u64,
    /// Frames dropped because they did not decode
    pub skipped: u64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
}

/// Read loop for one stream's inbound direction
pub struct InboundDispatcher {
    peer: PeerId,
    decoder: FrameDecoder,
    state: DispatchState,
}

impl InboundDispatcher {
    /// Create a dispatcher for frames from `peer`
    pub fn new(peer: PeerId, max_frame_size: usize) -> Self {
        Self {
            peer,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            state: DispatchState::Reading,
        }
    }

    /// Current state
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Run until the stream ends.
    ///
    /// `buffer` may hold bytes already read past negotiation. Returns the
    /// summary on clean EOF, or the framing/I/O error that closed the stream.
    /// In-flight handler tasks are awaited either way.
    pub async fn run<R, H>(
        &mut self,
        mut reader: R,
        mut buffer: BytesMut,
        handler: Arc<H>,
        reply: OutboundQueue,
    ) -> Result<DispatchSummary, SessionError>
    where
        R: AsyncRead + Unpin,
        H: EnvelopeHandler + ?Sized,
    {
        let peer = self.peer.clone();
        let mut summary = DispatchSummary::default();
        let mut in_flight: JoinSet<anyhow::Result<()>> = JoinSet::new();

        let outcome = loop {
            self.transition(DispatchState::Reading);

            let read = tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    record_handler_outcome(&peer, joined, &mut summary);
                    continue;
                }
                read = read_frame(&mut reader, &mut self.decoder, &mut buffer) => read,
            };

            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            summary.frames += 1;
            summary.bytes += frame.len() as u64;

            self.transition(DispatchState::Decoding);
            let envelope = match decode_envelope(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        "Skipping undecodable frame from {} ({} bytes): {}",
                        peer,
                        frame.len(),
                        e
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            info!(
                "Received {} from {} (task_id: {}, {} bytes)",
                envelope.kind(),
                peer,
                envelope.task_id().unwrap_or("-"),
                frame.len()
            );

            self.transition(DispatchState::Dispatching);
            let handler = handler.clone();
            let ctx = InboundContext {
                peer: peer.clone(),
                reply: reply.clone(),
            };
            in_flight.spawn(async move { handler.handle(envelope, ctx).await });
            summary.dispatched += 1;
        };

        self.transition(DispatchState::Closed);
        match &outcome {
            Ok(()) => debug!("Inbound stream from {} ended", peer),
            Err(e) => error!("Inbound stream from {} failed: {}", peer, e),
        }

        while let Some(joined) = in_flight.join_next().await {
            record_handler_outcome(&peer, joined, &mut summary);
        }

        info!(
            "Dispatcher for {} closed: {} frames, {} dispatched, {} skipped, {} handler failures",
            peer, summary.frames, summary.dispatched, summary.skipped, summary.handler_failures
        );

        outcome.map(|()| summary)
    }

    fn transition(&mut self, next: DispatchState) {
        trace!("Dispatcher for {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }
}

fn record_handler_outcome(
    peer: &PeerId,
    joined: Result<anyhow::Result<()>, JoinError>,
    summary: &mut DispatchSummary,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("Handler failed for envelope from {}: {:#}", peer, e);
            summary.handler_failures += 1;
        }
        Err(e) => {
            error!("Handler task for envelope from {} aborted: {}", peer, e);
            summary.handler_failures += 1;
        }
    }
}
