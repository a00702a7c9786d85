use crate::config::LocalClusterConfig;
use crate::error::TopologyError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One member of a cluster as seen by the local membership mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub id: String,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Id of the owning cluster view. Lookup only.
    #[serde(rename = "cluster", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl InstanceDescription {
    pub fn new(id: impl Into<String>, leader: bool) -> Self {
        Self {
            id: id.into(),
            leader,
            properties: BTreeMap::new(),
            cluster_id: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The set of instances that already agree on being one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
    #[serde(default)]
    pub instances: Vec<InstanceDescription>,
}

impl ClusterView {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            instances: Vec::new(),
        }
    }

    /// Adds an instance, stamping its back-reference with this view's id.
    /// An instance id already present is replaced.
    pub fn add_instance(&mut self, mut instance: InstanceDescription) {
        instance.cluster_id = Some(self.cluster_id.clone());
        if let Some(existing) = self.instances.iter_mut().find(|i| i.id == instance.id) {
            *existing = instance;
        } else {
            self.instances.push(instance);
        }
    }

    pub fn with_instance(mut self, instance: InstanceDescription) -> Self {
        self.add_instance(instance);
        self
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.iter().any(|i| i.id == instance_id)
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|i| i.id.as_str())
    }

    pub fn leader(&self) -> Option<&InstanceDescription> {
        self.instances.iter().find(|i| i.leader)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// A non-empty view is established once exactly one member leads.
    pub fn is_established(&self) -> bool {
        !self.is_empty() && self.instances.iter().filter(|i| i.leader).count() == 1
    }
}

/// Supplies the local cluster membership.
///
/// Implemented by whatever local mechanism maintains membership; the
/// connector protocol only consumes it and re-reads it on every ping and
/// every inbound request.
pub trait ClusterViewProvider: Send + Sync {
    fn local_instance_id(&self) -> &str;

    fn local_cluster_view(&self) -> Result<ClusterView, TopologyError>;
}

/// A provider backed by a fixed (but replaceable) view.
pub struct StaticClusterViewProvider {
    instance_id: String,
    view: RwLock<Option<ClusterView>>,
}

impl StaticClusterViewProvider {
    pub fn new(instance_id: impl Into<String>, view: ClusterView) -> Self {
        Self {
            instance_id: instance_id.into(),
            view: RwLock::new(Some(view)),
        }
    }

    /// A provider for a single-instance cluster led by `instance_id`.
    pub fn single(instance_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        let view = ClusterView::new(cluster_id).with_instance(InstanceDescription::new(instance_id.clone(), true));
        Self::new(instance_id, view)
    }

    /// Builds the view described by the `[local]` config section.
    pub fn from_config(local: &LocalClusterConfig) -> Result<Self, TopologyError> {
        if local.instance_id.is_empty() {
            return Err(TopologyError::Config("local.instance_id must not be empty".to_string()));
        }
        let mut view = ClusterView::new(local.cluster_id.clone());
        let mut me = InstanceDescription::new(local.instance_id.clone(), local.leader);
        me.properties = local.properties.clone();
        view.add_instance(me);
        for member in &local.members {
            if member != &local.instance_id {
                view.add_instance(InstanceDescription::new(member.clone(), false));
            }
        }
        Ok(Self::new(local.instance_id.clone(), view))
    }

    pub fn set_view(&self, view: ClusterView) {
        *self.view.write() = Some(view);
    }

    /// Simulates a membership mechanism that has not settled yet.
    pub fn clear_view(&self) {
        *self.view.write() = None;
    }
}

impl ClusterViewProvider for StaticClusterViewProvider {
    fn local_instance_id(&self) -> &str {
        &self.instance_id
    }

    fn local_cluster_view(&self) -> Result<ClusterView, TopologyError> {
        self.view.read().clone().ok_or(TopologyError::UndefinedClusterView)
    }
}
