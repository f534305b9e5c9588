//! Inference error types.

use decai_session::SessionError;
use thiserror::Error;

/// Errors raised while serving or consuming inference requests
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Request is well-formed but outside what this node will run
    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    /// No correlation state for the task id
    #[error("stale or unknown task: {0}")]
    StaleOrUnknownTask(String),

    /// Model is not in the local catalog
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// A field that must carry inline bytes references external content
    #[error("missing inline data for {0}")]
    MissingInlineData(&'static str),

    /// Proof engine failure
    #[error("proof engine error: {0}")]
    Engine(String),

    /// Reading model artifacts failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sending the reply failed
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Blocking proof task failed
    #[error("proof task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
