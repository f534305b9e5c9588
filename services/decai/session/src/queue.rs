//! Outbound queue for one stream direction.
//!
//! Producers push envelopes without blocking. Each push is packed and framed
//! on the caller's task so size violations surface immediately; the framed
//! bytes then travel through an unbounded channel to a single writer task
//! that owns the write half and drains it in push order.
//!
//! [`OutboundQueue::close`] queues a shutdown marker behind everything already
//! pushed and refuses later pushes; the writer half-closes the stream once
//! every accepted frame is out.
//!
//! The channel is unbounded: a peer that stops reading lets the backlog grow
//! without limit. `pending()` exposes the backlog so callers can watch it.

use bytes::Bytes;
use decai_wire::{frame_envelope, Envelope, MAX_FRAME_SIZE};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::SessionError;

#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Close,
}

/// Producer handle of an outbound queue
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outbound>,
    pending: Arc<AtomicUsize>,
    closing: Arc<AtomicBool>,
    max_frame_size: usize,
}

/// Consumer side of an outbound queue
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<AtomicUsize>,
}

/// What a writer task did before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterSummary {
    /// Frames written
    pub frames: u64,
    /// Bytes written, prefixes included
    pub bytes: u64,
}

impl OutboundQueue {
    /// Create a queue and its receiving end without a writer
    pub fn channel(max_frame_size: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let queue = Self {
            tx,
            pending: pending.clone(),
            closing: Arc::new(AtomicBool::new(false)),
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        };
        (queue, OutboundReceiver { rx, pending })
    }

    /// Create a queue whose writer task drains into `writer`
    pub fn spawn<W>(
        writer: W,
        max_frame_size: usize,
    ) -> (Self, JoinHandle<Result<WriterSummary, SessionError>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, receiver) = Self::channel(max_frame_size);
        let handle = tokio::spawn(run_writer(writer, receiver));
        (queue, handle)
    }

    /// Enqueue an envelope for sending.
    ///
    /// Never waits on the stream. Fails if the envelope cannot be framed or
    /// if the writer has already stopped.
    pub fn push(&self, envelope: Envelope) -> Result<(), SessionError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SessionError::StreamClosed);
        }
        let kind = envelope.kind();
        let frame = frame_envelope(&envelope, self.max_frame_size)?;
        let len = frame.len();

        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Outbound::Frame(frame)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(SessionError::StreamClosed);
        }

        debug!("Queued {} envelope ({} bytes framed)", kind, len);
        Ok(())
    }

    /// Ask the writer to half-close the stream once earlier frames are out.
    ///
    /// Later pushes fail with [`SessionError::StreamClosed`].
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    /// Number of frames queued but not yet taken by the writer
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Frame size limit applied on push
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl OutboundReceiver {
    /// Next framed envelope, or `None` once the queue is closed and drained
    /// or every producer is gone.
    ///
    /// Frames that raced past the close marker were accepted by `push`, so
    /// they are still handed out before `None`.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await? {
                Outbound::Frame(frame) => return Some(self.taken(frame)),
                Outbound::Close => self.rx.close(),
            }
        }
    }

    /// Next framed envelope if one is ready
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.try_recv().ok()? {
                Outbound::Frame(frame) => return Some(self.taken(frame)),
                Outbound::Close => self.rx.close(),
            }
        }
    }

    fn taken(&self, frame: Bytes) -> Bytes {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        frame
    }

    /// Stop accepting frames and discard the backlog
    pub fn close(&mut self) {
        self.rx.close();
        let mut dropped = 0;
        while let Ok(next) = self.rx.try_recv() {
            if let Outbound::Frame(_) = next {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Discarded {} unsent frames", dropped);
        }
    }
}

/// Drain `receiver` into `writer` in order, flushing after every frame.
///
/// Returns when the queue is closed or all producers are gone. On a write
/// failure the backlog is discarded and later pushes fail with
/// [`SessionError::StreamClosed`].
pub async fn run_writer<W>(
    mut writer: W,
    mut receiver: OutboundReceiver,
) -> Result<WriterSummary, SessionError>
where
    W: AsyncWrite + Unpin,
{
    let mut summary = WriterSummary::default();

    while let Some(frame) = receiver.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(
                "Outbound stream failed after {} frames: {}",
                summary.frames, e
            );
            receiver.close();
            return Err(SessionError::Io(e));
        }

        summary.frames += 1;
        summary.bytes += frame.len() as u64;
        trace!("Wrote frame of {} bytes", frame.len());
    }

    // Half-close so the peer sees EOF
    if let Err(e) = writer.shutdown().await {
        debug!("Error shutting down outbound stream: {}", e);
    }

    debug!(
        "Outbound queue drained: {} frames, {} bytes",
        summary.frames, summary.bytes
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use decai_wire::{decode_envelope, FrameDecoder, Invoice, InvoiceRequest, Service};
    use decai_wire::{BitcoinLightning, InvoiceDetails};
    use tokio::io::AsyncReadExt;

    fn invoice_request() -> Envelope {
        InvoiceRequest {
            service: Service::Inference,
        }
        .into()
    }

    fn invoice(id: &str) -> Envelope {
        Invoice {
            service: Service::Inference,
            invoice_id: id.to_string(),
            invoice: InvoiceDetails {
                bitcoin_lightning: BitcoinLightning {
                    lnurl: "lnurl1dp68gurn8ghj7".to_string(),
                    amount: 1_000,
                },
                expired_at: 1_700_000_000,
            },
        }
        .into()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_push_order() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (queue, writer) = OutboundQueue::spawn(local, MAX_FRAME_SIZE);

        let sent = vec![invoice_request(), invoice("inv-1"), invoice("inv-2")];
        for envelope in &sent {
            queue.push(envelope.clone()).unwrap();
        }
        drop(queue);

        let mut raw = Vec::new();
        remote.read_to_end(&mut raw).await.unwrap();
        let summary = writer.await.unwrap().unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.bytes, raw.len() as u64);

        let mut buf = BytesMut::from(&raw[..]);
        let mut decoder = FrameDecoder::new();
        let mut received = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            received.push(decode_envelope(&frame).unwrap());
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_push_after_stream_failure() {
        let (local, remote) = tokio::io::duplex(64);
        let (queue, writer) = OutboundQueue::spawn(local, MAX_FRAME_SIZE);
        drop(remote);

        // First push is accepted; the writer then hits the broken stream
        queue.push(invoice_request()).unwrap();
        assert!(writer.await.unwrap().is_err());

        assert!(queue.is_closed());
        assert!(matches!(
            queue.push(invoice_request()),
            Err(SessionError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_push_rejects_oversize_envelope() {
        let (queue, mut receiver) = OutboundQueue::channel(16);

        let result = queue.push(invoice("an-invoice-id-long-enough-to-overflow"));
        assert!(matches!(result, Err(SessionError::Wire(_))));
        assert!(receiver.try_recv().is_none());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_pending_tracks_backlog() {
        let (queue, mut receiver) = OutboundQueue::channel(MAX_FRAME_SIZE);

        queue.push(invoice_request()).unwrap();
        queue.push(invoice_request()).unwrap();
        assert_eq!(queue.pending(), 2);

        receiver.recv().await.unwrap();
        assert_eq!(queue.pending(), 1);

        receiver.try_recv().unwrap();
        assert_eq!(queue.pending(), 0);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_flushes_then_half_closes() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (queue, writer) = OutboundQueue::spawn(local, MAX_FRAME_SIZE);
        let producer = queue.clone();

        producer.push(invoice_request()).unwrap();
        queue.close();

        // EOF arrives even though a producer handle is still alive
        let mut raw = Vec::new();
        remote.read_to_end(&mut raw).await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap().frames, 1);
        assert!(matches!(
            producer.push(invoice_request()),
            Err(SessionError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_push_after_close_is_refused() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (queue, writer) = OutboundQueue::spawn(local, MAX_FRAME_SIZE);

        queue.push(invoice("before")).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.push(invoice("after")),
            Err(SessionError::StreamClosed)
        ));

        let mut raw = Vec::new();
        remote.read_to_end(&mut raw).await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap().frames, 1);
        assert_eq!(queue.pending(), 0);

        let mut buf = BytesMut::from(&raw[..]);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode_envelope(&frame).unwrap(), invoice("before"));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_frames_behind_close_marker_are_still_delivered() {
        let (queue, mut receiver) = OutboundQueue::channel(MAX_FRAME_SIZE);

        // A push that passed the closing check before close() ran
        queue.push(invoice("first")).unwrap();
        let _ = queue.tx.send(Outbound::Close);
        queue.pending.fetch_add(1, Ordering::Relaxed);
        let _ = queue.tx.send(Outbound::Frame(
            frame_envelope(&invoice("raced"), MAX_FRAME_SIZE).unwrap(),
        ));

        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_none());
        assert_eq!(queue.pending(), 0);
        assert!(matches!(
            queue.push(invoice("late")),
            Err(SessionError::StreamClosed)
        ));
    }

    #[test]
    fn test_receiver_close_discards_backlog() {
        let (queue, mut receiver) = OutboundQueue::channel(MAX_FRAME_SIZE);
        queue.push(invoice_request()).unwrap();
        queue.push(invoice_request()).unwrap();

        receiver.close();
        assert_eq!(queue.pending(), 0);
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_channel_clamps_frame_limit() {
        let (queue, _receiver) = OutboundQueue::channel(usize::MAX);
        assert_eq!(queue.max_frame_size(), MAX_FRAME_SIZE);
    }
}
