//! Server role: run requested models and prove the result.
//!
//! Requests are checked against local policy before any work starts. A
//! request this node will not run produces no reply; the rejection is
//! returned to the dispatcher, which logs it.

use async_trait::async_trait;
use bytes::Bytes;
use decai_session::{EnvelopeHandler, InboundContext, OutboundQueue};
use decai_wire::{DataRef, Envelope, InferenceOutput, InferenceRequest};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::catalog::ModelCatalog;
use crate::engine::ProofEngine;
use crate::InferenceError;

/// A request that passed policy, with everything the engine needs
#[derive(Debug, Clone)]
struct AcceptedRequest {
    task_id: String,
    model: String,
    compiled: Bytes,
    input: Bytes,
    srs: Bytes,
}

/// Inference service handling `inference_request` envelopes
pub struct InferenceService<E: ProofEngine + ?Sized> {
    engine: Arc<E>,
    catalog: Arc<ModelCatalog>,
}

impl<E: ProofEngine + ?Sized> InferenceService<E> {
    /// Serve the models in `catalog` using `engine`
    pub fn new(engine: Arc<E>, catalog: Arc<ModelCatalog>) -> Self {
        Self { engine, catalog }
    }

    /// Models this service accepts requests for
    pub fn models(&self) -> Vec<String> {
        self.catalog.names()
    }

    fn accept(&self, request: &InferenceRequest) -> Result<AcceptedRequest, InferenceError> {
        let input = inline_or_unsupported(&request.input, "input")?;
        let srs = inline_or_unsupported(&request.srs, "srs")?;

        let model = request.model.as_id().ok_or_else(|| {
            InferenceError::UnsupportedRequest(format!(
                "model {} is not referenced by id",
                request.model
            ))
        })?;
        let artifacts = self.catalog.get(model).ok_or_else(|| {
            InferenceError::UnsupportedRequest(format!("model {} is not served here", model))
        })?;

        Ok(AcceptedRequest {
            task_id: request.task_id.clone(),
            model: model.to_string(),
            compiled: artifacts.compiled.clone(),
            input,
            srs,
        })
    }

    /// Check policy, then produce the output for `request`
    pub async fn run(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceOutput, InferenceError> {
        let accepted = self.accept(request)?;
        info!(
            "Running {} for task {} ({} input bytes)",
            accepted.model,
            accepted.task_id,
            accepted.input.len()
        );

        let engine = self.engine.clone();
        let started = Instant::now();
        let task_id = accepted.task_id.clone();
        let model = accepted.model.clone();

        let output = tokio::task::spawn_blocking(move || prove_request(engine.as_ref(), accepted))
            .await??;

        info!(
            "Proved {} for task {} in {:?}",
            model,
            task_id,
            started.elapsed()
        );
        Ok(output)
    }

    /// Run `request` and queue the output on `reply`
    pub async fn serve(
        &self,
        request: &InferenceRequest,
        reply: &OutboundQueue,
    ) -> Result<(), InferenceError> {
        let output = self.run(request).await?;
        reply.push(output.into())?;
        Ok(())
    }
}

fn inline_or_unsupported(data: &DataRef, field: &str) -> Result<Bytes, InferenceError> {
    data.as_inline().cloned().ok_or_else(|| {
        InferenceError::UnsupportedRequest(format!(
            "{} must be inline data, got {}",
            field,
            data.describe()
        ))
    })
}

fn prove_request<E: ProofEngine + ?Sized>(
    engine: &E,
    request: AcceptedRequest,
) -> Result<InferenceOutput, InferenceError> {
    let witness = engine.gen_witness(&request.compiled, &request.input)?;
    let vk = engine.gen_vk(&request.compiled, &request.srs)?;
    let pk = engine.gen_pk(&vk, &request.compiled, &request.srs)?;
    let proof = engine.prove(&witness, &pk, &request.compiled, &request.srs)?;
    debug!(
        "Task {}: witness {} bytes, vk {} bytes, proof {} bytes",
        request.task_id,
        witness.len(),
        vk.len(),
        proof.len()
    );

    Ok(InferenceOutput {
        task_id: request.task_id,
        witness: DataRef::Inline(witness),
        proof: DataRef::Inline(proof),
        verifying_key: DataRef::Inline(vk),
    })
}

#[async_trait]
impl<E: ProofEngine + ?Sized> EnvelopeHandler for InferenceService<E> {
    async fn handle(&self, envelope: Envelope, ctx: InboundContext) -> anyhow::Result<()> {
        match envelope {
            Envelope::InferenceRequest(request) => {
                self.serve(&request, &ctx.reply).await?;
                Ok(())
            }
            other => {
                debug!("Ignoring {} from {}", other.kind(), ctx.peer);
                Ok(())
            }
        }
    }
}
