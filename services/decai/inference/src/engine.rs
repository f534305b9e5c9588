//! Proof engine seam.
//!
//! The zero-knowledge machinery is opaque to this crate: every input and
//! output is a byte blob the engine produced or will consume. Calls are
//! CPU-heavy and synchronous; callers run them on the blocking pool.

use bytes::Bytes;

use crate::InferenceError;

/// Witness generation, key generation, proving and verification
pub trait ProofEngine: Send + Sync + 'static {
    /// Run the compiled model on `input`; the witness holds the outputs
    fn gen_witness(&self, compiled: &[u8], input: &[u8]) -> Result<Bytes, InferenceError>;

    /// Verifying key for the compiled model under `srs`
    fn gen_vk(&self, compiled: &[u8], srs: &[u8]) -> Result<Bytes, InferenceError>;

    /// Proving key matching `vk`
    fn gen_pk(&self, vk: &[u8], compiled: &[u8], srs: &[u8]) -> Result<Bytes, InferenceError>;

    /// Proof that `witness` came from running the compiled model
    fn prove(
        &self,
        witness: &[u8],
        pk: &[u8],
        compiled: &[u8],
        srs: &[u8],
    ) -> Result<Bytes, InferenceError>;

    /// Check `proof` against `vk`
    fn verify(
        &self,
        proof: &[u8],
        vk: &[u8],
        settings: &[u8],
        srs: &[u8],
    ) -> Result<bool, InferenceError>;

    /// Model outputs stored in `witness`, rescaled using `settings`
    fn decode_outputs(&self, witness: &[u8], settings: &[u8])
        -> Result<Vec<Vec<f64>>, InferenceError>;
}
