//! Session error types.

use decai_wire::WireError;
use thiserror::Error;

/// Errors raised while running a peer stream
#[derive(Error, Debug)]
pub enum SessionError {
    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or packing failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The stream's writer has stopped; nothing more can be sent
    #[error("stream closed")]
    StreamClosed,

    /// Peer speaks a different application protocol
    #[error("protocol mismatch: expected {expected}, peer offered {actual}")]
    ProtocolMismatch {
        /// Protocol this node speaks
        expected: String,
        /// Protocol the peer announced
        actual: String,
    },

    /// Stream ended before negotiation completed
    #[error("stream ended during protocol negotiation")]
    NegotiationEof,

    /// Session task ended abnormally
    #[error("session task failed: {0}")]
    Task(String),
}
