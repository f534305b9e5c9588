//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Declared frame length exceeds the receiver's bound
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared length
        len: u64,
        /// Enforced maximum
        max: usize,
    },

    /// Length prefix is not a valid unsigned varint
    #[error("malformed frame length prefix")]
    MalformedFrame,

    /// Stream ended in the middle of a frame
    #[error("stream ended with {0} bytes of an incomplete frame")]
    TruncatedFrame(usize),

    /// Frame payload is not a packed object of the expected shape
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Packed object names zero or several envelope variants
    #[error("envelope carries {0} variants, expected exactly one")]
    UnknownOrEmptyEnvelope(usize),

    /// Envelope could not be packed
    #[error("envelope encoding failed: {0}")]
    Encode(String),
}

impl WireError {
    /// Whether this error must tear down the stream it came from
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::FrameTooLarge { .. } | WireError::MalformedFrame | WireError::TruncatedFrame(_)
        )
    }
}
