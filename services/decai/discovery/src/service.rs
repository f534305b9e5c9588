//! Service advertisement and provider discovery.
//!
//! Servers re-announce each service they offer shortly after every new
//! connection, so a peer that just joined the routing network can find them.
//! Clients wait a settle delay, then collect providers for a bounded window.
//! Neither side ever fails loudly: routing problems are logged and discovery
//! returns what it found, possibly nothing.

use decai_wire::{PeerId, PeerInfo};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ContentId, ContentRouting, DiscoveryError, ServiceDescriptor};

/// Timing and bounds for advertisement and discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Delay between a new connection and re-announcing services
    pub advertise_delay: Duration,
    /// Settle delay before the first provider lookup
    pub discovery_delay: Duration,
    /// How long a lookup may run
    pub discovery_timeout: Duration,
    /// Stop collecting after this many distinct providers
    pub max_providers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertise_delay: Duration::from_millis(500),
            discovery_delay: Duration::from_secs(1),
            discovery_timeout: Duration::from_secs(10),
            max_providers: 16,
        }
    }
}

/// Announces the services this node offers
pub struct ServiceAdvertiser<R: ContentRouting + ?Sized> {
    routing: Arc<R>,
    services: Vec<(ServiceDescriptor, ContentId)>,
    delay: Duration,
}

impl<R: ContentRouting + ?Sized> ServiceAdvertiser<R> {
    /// Create an advertiser that waits `delay` after each connection
    pub fn new(routing: Arc<R>, delay: Duration) -> Self {
        Self {
            routing,
            services: Vec::new(),
            delay,
        }
    }

    /// Register a service; returns its content id
    pub fn register(
        &mut self,
        descriptor: ServiceDescriptor,
    ) -> Result<ContentId, DiscoveryError> {
        let id = ContentId::for_service(&descriptor)?;
        if !self.services.iter().any(|(_, existing)| existing == &id) {
            info!("Offering {} as {}", descriptor.model, id);
            self.services.push((descriptor, id));
        }
        Ok(id)
    }

    /// Content ids of registered services
    pub fn content_ids(&self) -> Vec<ContentId> {
        self.services.iter().map(|(_, id)| *id).collect()
    }

    /// Announce every registered service now. Returns how many succeeded.
    pub async fn provide_all(&self) -> usize {
        provide_each(self.routing.as_ref(), &self.services).await
    }

    /// Schedule a re-announcement after a peer connects
    pub fn on_peer_connected(&self, peer: &PeerId) -> JoinHandle<usize> {
        let routing = self.routing.clone();
        let services = self.services.clone();
        let delay = self.delay;
        let peer = peer.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(
                "Re-announcing {} services after {} connected",
                services.len(),
                peer
            );
            provide_each(routing.as_ref(), &services).await
        })
    }
}

async fn provide_each<R: ContentRouting + ?Sized>(
    routing: &R,
    services: &[(ServiceDescriptor, ContentId)],
) -> usize {
    let mut provided = 0;
    for (descriptor, id) in services {
        match routing.provide(id).await {
            Ok(()) => {
                debug!("Provided {} ({})", id, descriptor.model);
                provided += 1;
            }
            Err(e) => warn!("Failed to provide {} ({}): {}", id, descriptor.model, e),
        }
    }
    provided
}

/// Finds peers offering a service
pub struct ServiceDiscovery<R: ContentRouting + ?Sized> {
    routing: Arc<R>,
    config: DiscoveryConfig,
}

impl<R: ContentRouting + ?Sized> ServiceDiscovery<R> {
    /// Create a discovery helper
    pub fn new(routing: Arc<R>, config: DiscoveryConfig) -> Self {
        Self { routing, config }
    }

    /// Providers of `descriptor`, possibly none
    pub async fn discover(&self, descriptor: &ServiceDescriptor) -> Vec<PeerInfo> {
        match ContentId::for_service(descriptor) {
            Ok(id) => self.find(&id).await,
            Err(e) => {
                warn!("Cannot derive content id for {}: {}", descriptor.model, e);
                Vec::new()
            }
        }
    }

    /// Providers of `id`, possibly none
    pub async fn find(&self, id: &ContentId) -> Vec<PeerInfo> {
        tokio::time::sleep(self.config.discovery_delay).await;

        let mut providers: Vec<PeerInfo> = Vec::new();
        let mut found = self.routing.find_providers(id);
        let max = self.config.max_providers;

        let collect = async {
            if max == 0 {
                return;
            }
            while let Some(item) = found.next().await {
                match item {
                    Ok(peer) => {
                        if providers.iter().any(|p| p.id == peer.id) {
                            continue;
                        }
                        debug!("Found provider {} for {}", peer.id, id);
                        providers.push(peer);
                        if providers.len() >= max {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Provider lookup for {} failed: {}", id, e);
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(self.config.discovery_timeout, collect)
            .await
            .is_err()
        {
            debug!(
                "Discovery window for {} elapsed after {:?}",
                id, self.config.discovery_timeout
            );
        }

        if providers.is_empty() {
            warn!("No providers found for {}", id);
        } else {
            info!("Found {} providers for {}", providers.len(), id);
        }
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRouting;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    fn peer(name: &str, port: u16) -> PeerInfo {
        PeerInfo::new(PeerId::from(name), vec![format!("127.0.0.1:{}", port)])
    }

    struct BrokenRouting;

    #[async_trait]
    impl ContentRouting for BrokenRouting {
        async fn provide(&self, _id: &ContentId) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::Routing("no routing peers".to_string()))
        }

        fn find_providers(
            &self,
            _id: &ContentId,
        ) -> BoxStream<'static, Result<PeerInfo, DiscoveryError>> {
            Box::pin(stream::iter(vec![Err(DiscoveryError::Routing(
                "no routing peers".to_string(),
            ))]))
        }
    }

    struct SilentRouting;

    #[async_trait]
    impl ContentRouting for SilentRouting {
        async fn provide(&self, _id: &ContentId) -> Result<(), DiscoveryError> {
            Ok(())
        }

        fn find_providers(
            &self,
            _id: &ContentId,
        ) -> BoxStream<'static, Result<PeerInfo, DiscoveryError>> {
            Box::pin(stream::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertised_service_is_discovered() {
        let routing = MemoryRouting::new();
        let server_routing = Arc::new(routing.router(peer("server", 10333)));
        let client_routing = Arc::new(routing.router(peer("client", 10334)));

        let mut advertiser = ServiceAdvertiser::new(server_routing, Duration::from_millis(500));
        let id = advertiser
            .register(ServiceDescriptor::model("mnist"))
            .unwrap();
        assert_eq!(advertiser.content_ids(), vec![id]);

        let provided = advertiser
            .on_peer_connected(&PeerId::from("client"))
            .await
            .unwrap();
        assert_eq!(provided, 1);

        let discovery = ServiceDiscovery::new(client_routing, DiscoveryConfig::default());
        let found = discovery
            .discover(&ServiceDescriptor::model("mnist"))
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, PeerId::from("server"));
        assert_eq!(found[0].addrs, vec!["127.0.0.1:10333".to_string()]);

        let nothing = discovery
            .discover(&ServiceDescriptor::model("resnet"))
            .await;
        assert!(nothing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisement_waits_for_delay() {
        let routing = MemoryRouting::new();
        let mut advertiser = ServiceAdvertiser::new(
            Arc::new(routing.router(peer("server", 10333))),
            Duration::from_millis(500),
        );
        let id = advertiser
            .register(ServiceDescriptor::model("mnist"))
            .unwrap();

        let pending = advertiser.on_peer_connected(&PeerId::from("client"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(routing.providers(&id).is_empty());

        pending.await.unwrap();
        assert_eq!(routing.providers(&id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_failures_are_not_fatal() {
        let routing = Arc::new(BrokenRouting);

        let mut advertiser = ServiceAdvertiser::new(routing.clone(), Duration::from_millis(500));
        advertiser
            .register(ServiceDescriptor::model("mnist"))
            .unwrap();
        assert_eq!(advertiser.provide_all().await, 0);

        let discovery = ServiceDiscovery::new(routing, DiscoveryConfig::default());
        assert!(discovery
            .discover(&ServiceDescriptor::model("mnist"))
            .await
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_is_time_bounded() {
        let config = DiscoveryConfig {
            discovery_timeout: Duration::from_secs(2),
            ..DiscoveryConfig::default()
        };
        let discovery = ServiceDiscovery::new(Arc::new(SilentRouting), config);

        let started = tokio::time::Instant::now();
        let found = discovery
            .discover(&ServiceDescriptor::model("mnist"))
            .await;
        assert!(found.is_empty());
        // Settle delay plus the full window, and no longer
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_stops_at_max_providers() {
        let routing = MemoryRouting::new();
        let id = ContentId::for_service(&ServiceDescriptor::model("mnist")).unwrap();
        for port in 0..5 {
            routing
                .router(peer(&format!("server-{}", port), 10_000 + port))
                .provide(&id)
                .await
                .unwrap();
        }

        let config = DiscoveryConfig {
            max_providers: 3,
            ..DiscoveryConfig::default()
        };
        let client = Arc::new(routing.router(peer("client", 1)));
        let discovery = ServiceDiscovery::new(client, config);
        assert_eq!(discovery.find(&id).await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_providers_finds_nothing() {
        let routing = MemoryRouting::new();
        let id = ContentId::for_service(&ServiceDescriptor::model("mnist")).unwrap();
        routing
            .router(peer("server", 10_000))
            .provide(&id)
            .await
            .unwrap();

        let config = DiscoveryConfig {
            max_providers: 0,
            ..DiscoveryConfig::default()
        };
        let client = Arc::new(routing.router(peer("client", 1)));
        let discovery = ServiceDiscovery::new(client, config);
        assert!(discovery.find(&id).await.is_empty());
    }
}
