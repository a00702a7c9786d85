use arc_swap::ArcSwap;
use std::sync::Arc;
use topolink_cluster::AnnouncementRegistry;
use topolink_core::{Clock, ClusterViewProvider, ConnectorConfig, TopologyError};
use topolink_trust::{NoPeerNames, PeerNameResolver, TrustPolicy};

/// Collaborators shared by the client, the connector registry and the
/// receiver.
///
/// Config and trust policy are swapped as a whole on reload; readers take a
/// snapshot per ping or per request and never observe a half-applied change.
pub struct ConnectorContext {
    config: ArcSwap<ConnectorConfig>,
    trust: ArcSwap<TrustPolicy>,
    provider: Arc<dyn ClusterViewProvider>,
    registry: Arc<AnnouncementRegistry>,
    peer_names: Arc<dyn PeerNameResolver>,
    clock: Arc<dyn Clock>,
}

impl ConnectorContext {
    pub fn new(
        config: ConnectorConfig,
        provider: Arc<dyn ClusterViewProvider>,
        registry: Arc<AnnouncementRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TopologyError> {
        let trust = TrustPolicy::from_config(&config, clock.clone())?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            trust: ArcSwap::from_pointee(trust),
            provider,
            registry,
            peer_names: Arc::new(NoPeerNames),
            clock,
        })
    }

    pub fn with_peer_names(mut self, peer_names: Arc<dyn PeerNameResolver>) -> Self {
        self.peer_names = peer_names;
        self
    }

    pub fn config(&self) -> Arc<ConnectorConfig> {
        self.config.load_full()
    }

    pub fn trust(&self) -> Arc<TrustPolicy> {
        self.trust.load_full()
    }

    pub fn provider(&self) -> &Arc<dyn ClusterViewProvider> {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<AnnouncementRegistry> {
        &self.registry
    }

    pub fn peer_names(&self) -> &dyn PeerNameResolver {
        self.peer_names.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn local_instance_id(&self) -> &str {
        self.provider.local_instance_id()
    }

    /// Validates `config`, rebuilds the trust policy from it and swaps both.
    /// On error nothing changes. Blocks while whitelist host names resolve.
    pub fn reload(&self, config: ConnectorConfig) -> Result<(), TopologyError> {
        config.validate()?;
        let trust = TrustPolicy::from_config(&config, self.clock.clone())?;
        self.trust.store(Arc::new(trust));
        self.config.store(Arc::new(config));
        tracing::info!("ConnectorContext: configuration reloaded");
        Ok(())
    }
}
