use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use topolink_core::{ClusterView, InstanceDescription, TopologyError, PROTOCOL_VERSION};

/// A statement "instance X sees cluster view Y and, through its peers,
/// knows about announcements Z".
///
/// Announcements form a tree: `inherited` holds what the owner relays on
/// behalf of third instances, each entry keeping its own `owner_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub owner_id: String,
    #[serde(default)]
    pub server_info: String,
    pub protocol_version: u32,
    /// Creation time at the owner, in ms. Informational only; expiry uses
    /// the receiver's clock.
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub r#loop: bool,
    #[serde(rename = "isInherited", default)]
    pub is_inherited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_cluster: Option<ClusterView>,
    #[serde(default)]
    pub inherited: Vec<Announcement>,
    /// Seconds the receiving connector should wait before pinging again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reset_backoff: bool,
}

impl Announcement {
    pub fn new(owner_id: impl Into<String>, created: u64) -> Self {
        Self {
            owner_id: owner_id.into(),
            server_info: String::new(),
            protocol_version: PROTOCOL_VERSION,
            created,
            r#loop: false,
            is_inherited: false,
            local_cluster: None,
            inherited: Vec::new(),
            backoff_interval: None,
            reset_backoff: false,
        }
    }

    pub fn with_server_info(mut self, server_info: impl Into<String>) -> Self {
        self.server_info = server_info.into();
        self
    }

    pub fn with_local_cluster(mut self, view: ClusterView) -> Self {
        self.local_cluster = Some(view);
        self
    }

    /// A reply that only says "you looped". Carries no topology.
    pub fn loop_reply(owner_id: impl Into<String>, created: u64) -> Self {
        let mut reply = Self::new(owner_id, created);
        reply.r#loop = true;
        reply
    }

    pub fn from_json(raw: &str) -> Result<Self, TopologyError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, TopologyError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Registry key. One entry per owner.
    pub fn primary_key(&self) -> &str {
        &self.owner_id
    }

    pub fn is_loop(&self) -> bool {
        self.r#loop
    }

    pub fn is_correct_version(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    /// A loop announcement is valid with just an owner. Anything else must
    /// speak our protocol version and list its owner inside its own
    /// non-empty cluster view.
    pub fn is_valid(&self) -> bool {
        if self.owner_id.is_empty() {
            return false;
        }
        if self.r#loop {
            return true;
        }
        if !self.is_correct_version() {
            return false;
        }
        match &self.local_cluster {
            Some(view) => !view.is_empty() && view.contains(&self.owner_id),
            None => false,
        }
    }

    /// Structural equality ignoring the per-ping fields (`created`, the
    /// backoff hints and the inherited marker), recursively.
    pub fn corresponds_to(&self, other: &Announcement) -> bool {
        self.without_ping_fields() == other.without_ping_fields()
    }

    fn without_ping_fields(&self) -> Announcement {
        let mut copy = self.clone();
        copy.strip_ping_fields();
        copy
    }

    fn strip_ping_fields(&mut self) {
        self.created = 0;
        self.is_inherited = false;
        self.backoff_interval = None;
        self.reset_backoff = false;
        for nested in &mut self.inherited {
            nested.strip_ping_fields();
        }
    }

    /// Every instance this announcement vouches for, own cluster first,
    /// then the inherited tree depth-first.
    pub fn list_instances(&self) -> Vec<&InstanceDescription> {
        let mut out = Vec::new();
        self.collect_instances(&mut out);
        out
    }

    fn collect_instances<'a>(&'a self, out: &mut Vec<&'a InstanceDescription>) {
        if let Some(view) = &self.local_cluster {
            out.extend(view.instances.iter());
        }
        for nested in &self.inherited {
            nested.collect_instances(out);
        }
    }

    pub fn instance_ids(&self) -> HashSet<&str> {
        self.list_instances().into_iter().map(|i| i.id.as_str()).collect()
    }

    /// Drops direct inherited entries owned by `owner_id`.
    pub fn remove_inherited(&mut self, owner_id: &str) {
        self.inherited.retain(|a| !(a.is_inherited && a.owner_id == owner_id));
    }

    /// Drops inherited entries, at any depth, whose owner satisfies `pred`.
    /// Returns how many subtrees were removed.
    pub fn prune_inherited(&mut self, pred: &dyn Fn(&str) -> bool) -> usize {
        let before = self.inherited.len();
        self.inherited.retain(|a| !pred(&a.owner_id));
        let mut removed = before - self.inherited.len();
        for nested in &mut self.inherited {
            removed += nested.prune_inherited(pred);
        }
        removed
    }

    /// 1 for an announcement without inherited entries.
    pub fn depth(&self) -> usize {
        1 + self.inherited.iter().map(Announcement::depth).max().unwrap_or(0)
    }

    pub fn nested_count(&self) -> usize {
        self.inherited.iter().map(|a| 1 + a.nested_count()).sum()
    }

    /// Guards against unbounded trees built up over many hops.
    pub fn validate_shape(&self, max_depth: usize, max_inherited: usize) -> Result<(), TopologyError> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(TopologyError::Protocol(format!(
                "announcement nesting depth {} exceeds {}",
                depth, max_depth
            )));
        }
        let nested = self.nested_count();
        if nested > max_inherited {
            return Err(TopologyError::Protocol(format!(
                "announcement carries {} inherited entries, limit is {}",
                nested, max_inherited
            )));
        }
        Ok(())
    }
}
