pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod listener;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterView, ClusterViewProvider, InstanceDescription, StaticClusterViewProvider};
pub use config::{ConnectorConfig, LocalClusterConfig};
pub use error::TopologyError;
pub use listener::{NoopListener, TopologyChange, TopologyListener};

/// Wire protocol version spoken by this implementation.
///
/// Peers announcing a different version are rejected at the receiver
/// boundary (400) so that rolling upgrades degrade to "not connected"
/// instead of corrupting the registry.
pub const PROTOCOL_VERSION: u32 = 1;
