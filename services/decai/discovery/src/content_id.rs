//! Content identifiers for service descriptors.
//!
//! A descriptor is serialized to compact JSON, hashed with SHA-256 and
//! wrapped as a version-1 content id:
//!
//! ```text
//! 0x01 | uvarint(0x0200 json) | 0x12 sha2-256 | 0x20 len | digest[32]
//! ```
//!
//! The text form is multibase base32 (lowercase, unpadded, `b` prefix), the
//! same form other peers print and parse.

use decai_wire::{read_uvarint, write_uvarint};
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::DiscoveryError;

/// Content id version
pub const CID_VERSION: u64 = 1;
/// Multicodec for JSON content
pub const JSON_CODEC: u64 = 0x0200;
/// Multihash code for sha2-256
pub const SHA2_256: u64 = 0x12;

const DIGEST_LEN: usize = 32;
const BASE32_PREFIX: char = 'b';

/// Names a computation a peer can service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Model name, e.g. `mnist`
    pub model: String,
}

impl ServiceDescriptor {
    /// Descriptor for a named model
    pub fn model(name: impl Into<String>) -> Self {
        Self { model: name.into() }
    }
}

/// Key under which providers of a service are advertised
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    codec: u64,
    digest: [u8; DIGEST_LEN],
}

impl ContentId {
    /// Key for a service descriptor
    pub fn for_service(descriptor: &ServiceDescriptor) -> Result<Self, DiscoveryError> {
        let json = serde_json::to_vec(descriptor)?;
        Ok(Self::from_json_bytes(&json))
    }

    /// Key for already-serialized JSON bytes
    pub fn from_json_bytes(json: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&Sha256::digest(json));
        Self {
            codec: JSON_CODEC,
            digest,
        }
    }

    /// Content codec
    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// SHA-256 digest of the content
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Binary form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + DIGEST_LEN);
        write_uvarint(&mut out, CID_VERSION);
        write_uvarint(&mut out, self.codec);
        write_uvarint(&mut out, SHA2_256);
        write_uvarint(&mut out, DIGEST_LEN as u64);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parse the binary form. Only version 1 with a sha2-256 multihash is accepted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        let mut rest = bytes;
        let mut next = |what: &str| -> Result<u64, DiscoveryError> {
            match read_uvarint(rest) {
                Ok(Some((value, used))) => {
                    rest = &rest[used..];
                    Ok(value)
                }
                _ => Err(DiscoveryError::InvalidContentId(format!("bad {}", what))),
            }
        };

        let version = next("version")?;
        let codec = next("codec")?;
        let hash = next("multihash code")?;
        let len = next("digest length")?;

        if version != CID_VERSION {
            return Err(DiscoveryError::InvalidContentId(format!(
                "unsupported version {}",
                version
            )));
        }
        if hash != SHA2_256 || len != DIGEST_LEN as u64 {
            return Err(DiscoveryError::InvalidContentId(format!(
                "unsupported multihash 0x{:x}/{}",
                hash, len
            )));
        }
        if rest.len() != DIGEST_LEN {
            return Err(DiscoveryError::InvalidContentId(format!(
                "digest is {} bytes",
                rest.len()
            )));
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(rest);
        Ok(Self { codec, digest })
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = BASE32_NOPAD.encode(&self.to_bytes()).to_ascii_lowercase();
        write!(f, "{}{}", BASE32_PREFIX, text)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self)
    }
}

impl FromStr for ContentId {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix(BASE32_PREFIX).ok_or_else(|| {
            DiscoveryError::InvalidContentId(format!("expected base32 multibase: {}", s))
        })?;
        // Lowercase only; the multibase prefix fixes the case
        if body.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(DiscoveryError::InvalidContentId(format!(
                "not lowercase base32: {}",
                s
            )));
        }
        let bytes = BASE32_NOPAD
            .decode(body.to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                DiscoveryError::InvalidContentId(format!("not base32: {} ({})", s, e))
            })?;
        Self::from_bytes(&bytes)
    }
}
