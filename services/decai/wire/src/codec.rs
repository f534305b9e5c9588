//! MessagePack packing of envelopes.
//!
//! Envelopes are packed as maps with named fields so peers written against
//! the same schema in other languages can read them. Binary fields are
//! MessagePack `bin` values and are never text-encoded.

use bytes::Bytes;
use tracing::trace;

use crate::envelope::RawEnvelope;
use crate::frame::encode_frame;
use crate::{Envelope, WireError};

/// Pack an envelope into its MessagePack representation
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, WireError> {
    let raw = RawEnvelope::from(envelope.clone());
    let packed = rmp_serde::to_vec_named(&raw).map_err(|e| WireError::Encode(e.to_string()))?;

    trace!("Packed {} envelope into {} bytes", envelope.kind(), packed.len());
    Ok(Bytes::from(packed))
}

/// Unpack an envelope from a frame payload.
///
/// Fails with [`WireError::MalformedEnvelope`] when the payload is not a
/// packed object of the envelope shape, and with
/// [`WireError::UnknownOrEmptyEnvelope`] when it names zero or several
/// variants.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, WireError> {
    let raw: RawEnvelope = rmp_serde::from_slice(payload)
        .map_err(|e| WireError::MalformedEnvelope(e.to_string()))?;

    Envelope::try_from(raw)
}

/// Pack an envelope and prefix it with its length
pub fn frame_envelope(envelope: &Envelope, max_frame_size: usize) -> Result<Bytes, WireError> {
    let packed = encode_envelope(envelope)?;
    encode_frame(&packed, max_frame_size)
}
