use crate::client::{ConnectorInfo, TopologyConnectorClient};
use crate::context::ConnectorContext;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use topolink_core::TopologyError;
use uuid::Uuid;

/// The set of configured outgoing connectors, at most one per endpoint.
pub struct ConnectorRegistry {
    context: Arc<ConnectorContext>,
    clients: RwLock<HashMap<Uuid, Arc<TopologyConnectorClient>>>,
}

impl ConnectorRegistry {
    pub fn new(context: Arc<ConnectorContext>) -> Self {
        Self {
            context,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<ConnectorContext> {
        &self.context
    }

    /// Adds a connector for `endpoint` without pinging it; the first ping
    /// happens on the next heartbeat. An endpoint that is already configured
    /// returns the existing connector.
    pub fn register_outgoing_connector(&self, endpoint: &str) -> Result<ConnectorInfo, TopologyError> {
        let candidate = TopologyConnectorClient::new(endpoint, self.context.clone())?;
        let client = {
            let mut clients = self.clients.write();
            let existing = clients
                .values()
                .find(|c| c.endpoint() == candidate.endpoint())
                .cloned();
            match existing {
                Some(existing) => existing,
                None => {
                    let client = Arc::new(candidate);
                    clients.insert(client.id(), client.clone());
                    tracing::info!("ConnectorRegistry: registered connector {} to {}", client.id(), client.endpoint());
                    client
                }
            }
        };
        Ok(client.info())
    }

    /// Removes the connector and disconnects it. Local cleanup happens
    /// before this returns; the DELETE to the peer runs in the background
    /// when a runtime is available. An in-flight ping is not waited for.
    pub fn unregister_outgoing_connector(&self, id: Uuid) -> bool {
        let Some(client) = self.clients.write().remove(&id) else {
            return false;
        };
        tracing::info!("ConnectorRegistry: unregistering connector {} to {}", id, client.endpoint());
        if let Some(owner) = client.retire() {
            self.context.registry().unregister_announcement(&owner);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { client.disconnect().await });
            }
            Err(_) => tracing::debug!("ConnectorRegistry: no runtime, skipping DELETE for {}", id),
        }
        true
    }

    pub fn list_outgoing_connectors(&self) -> Vec<ConnectorInfo> {
        let clients: Vec<_> = self.clients.read().values().cloned().collect();
        let mut infos: Vec<ConnectorInfo> = clients.iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        infos
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<TopologyConnectorClient>> {
        self.clients.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Pings every connector, one after another. Each ping carries its own
    /// timeout, so a dead peer only delays the rest of this round.
    pub async fn ping_outgoing_connectors(&self, force: bool) {
        let clients: Vec<_> = self.clients.read().values().cloned().collect();
        for client in clients {
            client.ping(force).await;
        }
    }

    /// Reconciles the connector set with `endpoints`: adds what is new,
    /// unregisters what is gone. Invalid endpoints are skipped and logged.
    pub fn sync_connectors(&self, endpoints: &[String]) {
        let mut wanted = HashSet::new();
        for endpoint in endpoints {
            match self.register_outgoing_connector(endpoint) {
                Ok(info) => {
                    wanted.insert(info.id);
                }
                Err(e) => tracing::warn!("ConnectorRegistry: skipping endpoint {}: {}", endpoint, e),
            }
        }
        let stale: Vec<Uuid> = self
            .clients
            .read()
            .keys()
            .filter(|id| !wanted.contains(*id))
            .copied()
            .collect();
        for id in stale {
            self.unregister_outgoing_connector(id);
        }
    }

    /// Disconnects every connector and waits for the DELETEs.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.disconnect().await;
        }
    }
}
