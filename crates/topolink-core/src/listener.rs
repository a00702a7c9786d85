/// A change to the set of announcements known to this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    Registered(String),
    /// Same owner, different topology content.
    Updated(String),
    /// Explicit disconnect or unregister.
    Removed(String),
    Expired(String),
}

impl TopologyChange {
    pub fn owner_id(&self) -> &str {
        match self {
            TopologyChange::Registered(id)
            | TopologyChange::Updated(id)
            | TopologyChange::Removed(id)
            | TopologyChange::Expired(id) => id,
        }
    }
}

/// Hook for the topology event publisher.
///
/// Invoked after the registry lock has been released, so implementations
/// may call back into the registry.
pub trait TopologyListener: Send + Sync {
    fn topology_changed(&self, change: TopologyChange);
}

pub struct NoopListener;

impl TopologyListener for NoopListener {
    fn topology_changed(&self, _change: TopologyChange) {}
}
