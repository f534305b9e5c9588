//! Content routing seam and the bundled in-memory provider table.

use async_trait::async_trait;
use dashmap::DashMap;
use decai_wire::{PeerId, PeerInfo};
use futures::stream::{self, BoxStream};
use std::sync::Arc;
use tracing::debug;

use crate::{ContentId, DiscoveryError};

/// Provider records keyed by content id
#[async_trait]
pub trait ContentRouting: Send + Sync + 'static {
    /// Announce the local peer as a provider of `id`
    async fn provide(&self, id: &ContentId) -> Result<(), DiscoveryError>;

    /// Stream providers of `id`. The stream may be long-lived; callers bound it.
    fn find_providers(
        &self,
        id: &ContentId,
    ) -> BoxStream<'static, Result<PeerInfo, DiscoveryError>>;
}

/// Process-local provider table shared by several routers
#[derive(Debug, Clone, Default)]
pub struct MemoryRouting {
    table: Arc<DashMap<ContentId, Vec<PeerInfo>>>,
}

impl MemoryRouting {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Router acting on behalf of `local`
    pub fn router(&self, local: PeerInfo) -> MemoryRouter {
        MemoryRouter {
            local,
            table: self.table.clone(),
        }
    }

    /// Every provider recorded for `id`
    pub fn providers(&self, id: &ContentId) -> Vec<PeerInfo> {
        self.table
            .get(id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Drop `peer` from every record, e.g. when it disconnects
    pub fn withdraw(&self, peer: &PeerId) {
        self.table.retain(|_, providers| {
            providers.retain(|p| &p.id != peer);
            !providers.is_empty()
        });
    }
}

/// One peer's handle onto a [`MemoryRouting`] table
#[derive(Debug, Clone)]
pub struct MemoryRouter {
    local: PeerInfo,
    table: Arc<DashMap<ContentId, Vec<PeerInfo>>>,
}

impl MemoryRouter {
    /// Peer this router provides as
    pub fn local(&self) -> &PeerInfo {
        &self.local
    }
}

#[async_trait]
impl ContentRouting for MemoryRouter {
    async fn provide(&self, id: &ContentId) -> Result<(), DiscoveryError> {
        let mut providers = self.table.entry(*id).or_default();
        match providers.iter_mut().find(|p| p.id == self.local.id) {
            Some(existing) => existing.addrs = self.local.addrs.clone(),
            None => providers.push(self.local.clone()),
        }
        debug!("{} provides {}", self.local.id, id);
        Ok(())
    }

    fn find_providers(
        &self,
        id: &ContentId,
    ) -> BoxStream<'static, Result<PeerInfo, DiscoveryError>> {
        let found: Vec<PeerInfo> = self
            .table
            .get(id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|p| p.id != self.local.id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        debug!("{} providers of {} visible to {}", found.len(), id, self.local.id);
        Box::pin(stream::iter(found.into_iter().map(Ok)))
    }
}
