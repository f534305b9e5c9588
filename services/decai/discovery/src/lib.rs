//! Content-addressed service advertisement for decai peers
//!
//! A service ("I run model `mnist`") is named by a content id derived from
//! its descriptor. Servers provide that id through a [`ContentRouting`]
//! backend; clients look it up to find peers to dial.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod content_id;
pub mod error;
pub mod routing;
pub mod service;

// Re-export main types
pub use content_id::{ContentId, ServiceDescriptor, JSON_CODEC, SHA2_256};
pub use error::DiscoveryError;
pub use routing::{ContentRouting, MemoryRouter, MemoryRouting};
pub use service::{DiscoveryConfig, ServiceAdvertiser, ServiceDiscovery};
