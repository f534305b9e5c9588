//! Peer identity shared by sessions and service discovery.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque peer identifier assigned by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a transport-assigned identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A peer and the addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Dialable addresses, e.g. `127.0.0.1:10333`
    pub addrs: Vec<String>,
}

impl PeerInfo {
    /// Create peer info with the given addresses
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }
}
