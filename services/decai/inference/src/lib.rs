//! Verifiable inference over decai peer sessions
//!
//! The server role ([`InferenceService`]) runs a requested model, proves the
//! run and replies with the witness, proof and verifying key. The client role
//! ([`InferenceClient`]) forms requests, remembers what it asked for in a
//! [`TaskCorrelator`] and verifies the proof when the output comes back.
//! Both plug into a session as its envelope handler.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod client;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod server;

// Re-export main types
pub use catalog::{ModelArtifacts, ModelCatalog};
pub use client::{InferenceClient, InferenceVerdict, PendingTask};
pub use correlator::{TaskCorrelator, TaskId};
pub use engine::ProofEngine;
pub use error::InferenceError;
pub use server::InferenceService;
