//! Discovery error types.

use thiserror::Error;

/// Errors raised by content routing and content-id handling
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Routing backend failed
    #[error("routing error: {0}")]
    Routing(String),

    /// Service descriptor could not be serialized
    #[error("descriptor serialization error: {0}")]
    Descriptor(#[from] serde_json::Error),

    /// Text or bytes are not a content id this node understands
    #[error("invalid content id: {0}")]
    InvalidContentId(String),
}
