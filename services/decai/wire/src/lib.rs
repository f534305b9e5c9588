//! Envelope schema, packing and framing for the decai peer protocol.
//!
//! This crate provides the low-level wire protocol for decai peers: the
//! tagged-union [`Envelope`] exchanged over a stream, its MessagePack
//! encoding, and the varint length-prefixed framing that preserves message
//! boundaries on a reliable byte stream.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------+
//! | uvarint frame_len    | LEB128, 1..10 bytes              |
//! +----------------------+----------------------------------+
//! | payload              | MessagePack map, exactly one key |
//! |                      | naming the envelope variant      |
//! +----------------------+----------------------------------+
//! ```
//!
//! Receivers enforce [`MAX_FRAME_SIZE`] (64 MiB) before buffering a frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod peer;

// Re-export main types
pub use codec::{decode_envelope, encode_envelope, frame_envelope};
pub use envelope::{
    BitcoinLightning, DataRef, Envelope, EnvelopeKind, HuggingFaceRepo, InferenceOutput,
    InferenceRequest, Invoice, InvoiceDetails, InvoiceFulfilled, InvoiceRequest, IpfsLink,
    ModelRef, PrivateInputClaim, PrivateModelClaim, Service,
};
pub use error::WireError;
pub use frame::{
    encode_frame, read_uvarint, write_uvarint, FrameDecoder, DEFAULT_PROTOCOL_ID,
    MAX_FRAME_SIZE, MAX_VARINT_LEN,
};
pub use peer::{PeerId, PeerInfo};
