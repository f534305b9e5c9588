//! Client role: request inference and verify what comes back.
//!
//! Each request is remembered in a [`TaskCorrelator`] under its task id,
//! together with the SRS the server was asked to use. When the matching
//! `inference_output` arrives, the proof is checked against that SRS and the
//! model's settings, and a verdict is handed to the application.

use async_trait::async_trait;
use bytes::Bytes;
use decai_session::{EnvelopeHandler, InboundContext, OutboundQueue};
use decai_wire::{DataRef, Envelope, InferenceOutput, InferenceRequest, ModelRef};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::correlator::{TaskCorrelator, TaskId};
use crate::engine::ProofEngine;
use crate::InferenceError;

/// Requester state kept until the output arrives
#[derive(Debug, Clone)]
pub struct PendingTask {
    /// Model that was requested
    pub model_id: String,
    /// SRS the server was asked to prove with
    pub srs: Bytes,
    /// When the request was queued
    pub submitted_at: Instant,
}

/// Outcome of one request
#[derive(Debug, Clone)]
pub struct InferenceVerdict {
    /// Task the verdict is for
    pub task_id: TaskId,
    /// Model that was requested
    pub model_id: String,
    /// Whether the proof verified
    pub verified: bool,
    /// Raw witness from the server
    pub witness: Bytes,
    /// Decoded model outputs; empty if they could not be decoded
    pub outputs: Vec<Vec<f64>>,
    /// Time from request to verdict
    pub elapsed: Duration,
}

impl InferenceVerdict {
    /// Index of the largest value in each output, e.g. the predicted digit
    pub fn predicted(&self) -> Vec<usize> {
        self.outputs
            .iter()
            .filter_map(|scores| {
                scores
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
            })
            .collect()
    }
}

/// Forms requests and checks outputs
pub struct InferenceClient<E: ProofEngine + ?Sized> {
    engine: Arc<E>,
    catalog: Arc<ModelCatalog>,
    tasks: Arc<TaskCorrelator<PendingTask>>,
    verdicts: mpsc::UnboundedSender<InferenceVerdict>,
}

impl<E: ProofEngine + ?Sized> InferenceClient<E> {
    /// Create a client; verdicts arrive on the returned receiver
    pub fn new(
        engine: Arc<E>,
        catalog: Arc<ModelCatalog>,
    ) -> (Self, mpsc::UnboundedReceiver<InferenceVerdict>) {
        let (verdicts, receiver) = mpsc::unbounded_channel();
        let client = Self {
            engine,
            catalog,
            tasks: Arc::new(TaskCorrelator::new()),
            verdicts,
        };
        (client, receiver)
    }

    /// Outstanding requests
    pub fn tasks(&self) -> &Arc<TaskCorrelator<PendingTask>> {
        &self.tasks
    }

    /// Queue an inference request on `queue`; returns its task id
    pub fn request(
        &self,
        queue: &OutboundQueue,
        model_id: &str,
        input: Bytes,
        srs: Bytes,
    ) -> Result<TaskId, InferenceError> {
        let task_id = self.tasks.begin(PendingTask {
            model_id: model_id.to_string(),
            srs: srs.clone(),
            submitted_at: Instant::now(),
        });

        let request = InferenceRequest {
            task_id: task_id.clone(),
            input: DataRef::Inline(input),
            model: ModelRef::Id(model_id.to_string()),
            srs: DataRef::Inline(srs),
            invoice_fulfilled: None,
        };

        if let Err(e) = queue.push(request.into()) {
            self.tasks.forget(&task_id);
            return Err(e.into());
        }

        info!("Requested {} as task {}", model_id, task_id);
        Ok(task_id)
    }

    /// Verify an output against the request it answers
    pub async fn check_output(
        &self,
        output: InferenceOutput,
    ) -> Result<InferenceVerdict, InferenceError> {
        let pending = self.tasks.resolve(&output.task_id)?;

        let proof = inline(&output.proof, "proof")?;
        let vk = inline(&output.verifying_key, "verifying_key")?;
        let witness = inline(&output.witness, "witness")?;
        let settings = self
            .catalog
            .require(&pending.model_id)?
            .settings
            .clone()
            .ok_or_else(|| {
                InferenceError::UnknownModel(format!("{} has no settings", pending.model_id))
            })?;

        let engine = self.engine.clone();
        let srs = pending.srs.clone();
        let decoded_witness = witness.clone();
        let task_id = output.task_id.clone();
        let (verified, outputs) = tokio::task::spawn_blocking(move || {
            let verified = engine.verify(&proof, &vk, &settings, &srs)?;
            let outputs = match engine.decode_outputs(&decoded_witness, &settings) {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!("Could not decode outputs for task {}: {}", task_id, e);
                    Vec::new()
                }
            };
            Ok::<_, InferenceError>((verified, outputs))
        })
        .await??;

        Ok(InferenceVerdict {
            task_id: output.task_id,
            model_id: pending.model_id,
            verified,
            witness,
            outputs,
            elapsed: pending.submitted_at.elapsed(),
        })
    }

    /// Verify an output and publish the verdict
    pub async fn handle_output(&self, output: InferenceOutput) -> Result<(), InferenceError> {
        let verdict = self.check_output(output).await?;
        if verdict.verified {
            info!(
                "Task {} verified in {:?}, predicted {:?}",
                verdict.task_id,
                verdict.elapsed,
                verdict.predicted()
            );
        } else {
            warn!("Task {} returned a proof that does not verify", verdict.task_id);
        }

        if self.verdicts.send(verdict).is_err() {
            debug!("Verdict receiver dropped");
        }
        Ok(())
    }
}

fn inline(data: &DataRef, field: &'static str) -> Result<Bytes, InferenceError> {
    data.as_inline()
        .cloned()
        .ok_or(InferenceError::MissingInlineData(field))
}

#[async_trait]
impl<E: ProofEngine + ?Sized> EnvelopeHandler for InferenceClient<E> {
    async fn handle(&self, envelope: Envelope, ctx: InboundContext) -> anyhow::Result<()> {
        match envelope {
            Envelope::InferenceOutput(output) => {
                self.handle_output(output).await?;
                Ok(())
            }
            other => {
                debug!("Ignoring {} from {}", other.kind(), ctx.peer);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelArtifacts;
    use crate::engine::testing::StubEngine;
    use crate::server::InferenceService;
    use decai_session::{PeerSession, SessionConfig};
    use decai_wire::{decode_envelope, FrameDecoder, PeerId, MAX_FRAME_SIZE};

    fn catalog() -> Arc<ModelCatalog> {
        let mut catalog = ModelCatalog::new();
        catalog.insert(
            "mnist",
            ModelArtifacts {
                compiled: Bytes::from_static(b"mnist-circuit"),
                settings: Some(Bytes::from_static(b"{\"model_output_scales\":[7]}")),
            },
        );
        Arc::new(catalog)
    }

    fn sent_request(receiver: &mut decai_session::OutboundReceiver) -> InferenceRequest {
        let frame = receiver.try_recv().unwrap();
        let mut buf = bytes::BytesMut::from(&frame[..]);
        let payload = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        match decode_envelope(&payload).unwrap() {
            Envelope::InferenceRequest(request) => request,
            other => panic!("expected inference_request, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_request_is_correlated() {
        let (client, _verdicts) =
            InferenceClient::new(Arc::new(StubEngine::default()), catalog());
        let (queue, mut outbound) = OutboundQueue::channel(MAX_FRAME_SIZE);

        let task_id = client
            .request(&queue, "mnist", Bytes::from_static(b"input"), Bytes::from_static(b"srs"))
            .unwrap();

        let request = sent_request(&mut outbound);
        assert_eq!(request.task_id, task_id);
        assert_eq!(request.model, ModelRef::Id("mnist".to_string()));
        assert!(client.tasks().contains(&task_id));
    }

    #[tokio::test]
    async fn test_failed_push_forgets_task() {
        let (client, _verdicts) =
            InferenceClient::new(Arc::new(StubEngine::default()), catalog());
        let (queue, outbound) = OutboundQueue::channel(MAX_FRAME_SIZE);
        drop(outbound);

        let result = client.request(&queue, "mnist", Bytes::new(), Bytes::new());
        assert!(matches!(result, Err(InferenceError::Session(_))));
        assert!(client.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_output_for_unknown_task_is_rejected() {
        let (client, mut verdicts) =
            InferenceClient::new(Arc::new(StubEngine::default()), catalog());

        let output = InferenceOutput {
            task_id: "never-sent".to_string(),
            witness: DataRef::Inline(Bytes::new()),
            proof: DataRef::Inline(Bytes::new()),
            verifying_key: DataRef::Inline(Bytes::new()),
        };
        assert!(matches!(
            client.handle_output(output).await,
            Err(InferenceError::StaleOrUnknownTask(_))
        ));
        assert!(verdicts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_verification_uses_the_stored_srs() {
        let engine = Arc::new(StubEngine::default());
        let (client, mut verdicts) = InferenceClient::new(engine.clone(), catalog());
        let server = InferenceService::new(engine, catalog());
        let (queue, mut outbound) = OutboundQueue::channel(MAX_FRAME_SIZE);

        // Server proves with a different SRS than the one the client asked for
        client
            .request(&queue, "mnist", Bytes::from_static(b"input"), Bytes::from_static(b"srs-a"))
            .unwrap();
        let mut request = sent_request(&mut outbound);
        request.srs = DataRef::Inline(Bytes::from_static(b"srs-b"));
        let output = server.run(&request).await.unwrap();

        client.handle_output(output).await.unwrap();
        let verdict = verdicts.recv().await.unwrap();
        assert!(!verdict.verified);
        assert!(client.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_over_a_session() {
        let engine = Arc::new(StubEngine::default());
        let (client, mut verdicts) = InferenceClient::new(engine.clone(), catalog());
        let client = Arc::new(client);
        let server = Arc::new(InferenceService::new(engine, catalog()));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_config = SessionConfig::new(PeerId::from("server"));
        let server_session = tokio::spawn(async move {
            PeerSession::start(&server_config, server_io, server, None).await
        });
        let session = PeerSession::start(
            &SessionConfig::new(PeerId::from("client")),
            client_io,
            client.clone(),
            None,
        )
        .await
        .unwrap();
        let server_session = server_session.await.unwrap().unwrap();

        let task_id = client
            .request(
                session.queue(),
                "mnist",
                Bytes::from_static(b"{\"input_data\":[[0.0,1.0]]}"),
                Bytes::from_static(b"srs-14"),
            )
            .unwrap();

        let verdict = verdicts.recv().await.unwrap();
        assert_eq!(verdict.task_id, task_id);
        assert_eq!(verdict.model_id, "mnist");
        assert!(verdict.verified);
        assert_eq!(verdict.predicted(), vec![2]);
        assert!(client.tasks().is_empty());

        session.close();
        let summary = server_session.closed().await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.handler_failures, 0);
    }

    #[test]
    fn test_predicted_picks_largest_score() {
        let verdict = InferenceVerdict {
            task_id: "t".to_string(),
            model_id: "mnist".to_string(),
            verified: true,
            witness: Bytes::new(),
            outputs: vec![vec![0.1, 0.7, 0.2], vec![], vec![0.9, 0.05]],
            elapsed: Duration::from_millis(5),
        };
        assert_eq!(verdict.predicted(), vec![1, 0]);
    }
}
