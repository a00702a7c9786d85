use crate::announcement::Announcement;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use topolink_core::{Clock, ConnectorConfig, InstanceDescription, NoopListener, TopologyChange, TopologyListener};

/// Result of [`AnnouncementRegistry::announce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Stored, either for the first time or replacing different content.
    Registered,
    /// Same content as the active entry; only its expiry moved forward.
    Renewed,
    /// Invalid, or the owner is already known through another entry. Not
    /// an error: the caller reports a loop.
    Rejected,
}

/// A registry entry together with the receiver-side bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedAnnouncement {
    announcement: Announcement,
    first_seen_millis: u64,
    last_ping_millis: u64,
    expires_at_millis: u64,
}

impl CachedAnnouncement {
    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub fn first_seen_millis(&self) -> u64 {
        self.first_seen_millis
    }

    pub fn last_ping_millis(&self) -> u64 {
        self.last_ping_millis
    }

    pub fn expires_at_millis(&self) -> u64 {
        self.expires_at_millis
    }

    pub fn has_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at_millis
    }
}

/// Everything this instance has heard about, directly or transitively,
/// keyed by announcement owner.
///
/// All mutations go through one lock so that the "already active" check and
/// the insert are atomic. Expired entries are purged on every access.
/// Listener callbacks run after the lock is released.
pub struct AnnouncementRegistry {
    local_instance_id: String,
    timeout_millis: u64,
    max_inherited: usize,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn TopologyListener>,
    entries: Mutex<HashMap<String, CachedAnnouncement>>,
}

impl AnnouncementRegistry {
    pub fn new(local_instance_id: impl Into<String>, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_instance_id: local_instance_id.into(),
            timeout_millis: timeout.as_millis() as u64,
            max_inherited: usize::MAX,
            clock,
            listener: Arc::new(NoopListener),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ConnectorConfig, local_instance_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::new(local_instance_id, config.heartbeat_timeout(), clock).with_max_inherited(config.max_inherited)
    }

    pub fn with_listener(mut self, listener: Arc<dyn TopologyListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_max_inherited(mut self, max_inherited: usize) -> Self {
        self.max_inherited = max_inherited;
        self
    }

    pub fn local_instance_id(&self) -> &str {
        &self.local_instance_id
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    /// Strict registration: `false` without mutation when the owner already
    /// has an active entry, when the owner is already visible inside another
    /// entry, or when the announcement is invalid.
    pub fn register_announcement(&self, announcement: Announcement) -> bool {
        if !self.acceptable(&announcement) {
            return false;
        }
        let now = self.clock.now_millis();
        let owner = announcement.owner_id.clone();
        let (registered, mut events) = {
            let mut entries = self.entries.lock();
            let events = purge_locked(&mut entries, now);
            if entries.contains_key(&owner) || attached_elsewhere(&entries, &owner) {
                (false, events)
            } else {
                entries.insert(owner.clone(), self.cache(announcement, now, now));
                (true, events)
            }
        };
        if registered {
            tracing::debug!("AnnouncementRegistry: registered {}", owner);
            events.push(TopologyChange::Registered(owner));
        }
        self.notify(events);
        registered
    }

    /// Per-ping registration used by the connector client and receiver.
    ///
    /// Unchanged content renews the expiry. Changed content replaces the
    /// entry after re-running the attachment check; if that check fails the
    /// old entry is dropped as well, since its owner's topology now overlaps
    /// another entry.
    pub fn announce(&self, announcement: Announcement) -> RegistrationOutcome {
        if !self.acceptable(&announcement) {
            return RegistrationOutcome::Rejected;
        }
        let now = self.clock.now_millis();
        let owner = announcement.owner_id.clone();
        let (outcome, events) = {
            let mut entries = self.entries.lock();
            let mut events = purge_locked(&mut entries, now);
            let previous = entries.remove(&owner);
            match previous {
                Some(mut cached) if cached.announcement.corresponds_to(&announcement) => {
                    cached.announcement.created = announcement.created;
                    cached.last_ping_millis = now;
                    cached.expires_at_millis = now + self.timeout_millis;
                    entries.insert(owner.clone(), cached);
                    (RegistrationOutcome::Renewed, events)
                }
                previous => {
                    if attached_elsewhere(&entries, &owner) {
                        tracing::info!("AnnouncementRegistry: {} is already attached through another connector", owner);
                        if previous.is_some() {
                            events.push(TopologyChange::Removed(owner.clone()));
                        }
                        (RegistrationOutcome::Rejected, events)
                    } else {
                        let first_seen = previous.as_ref().map_or(now, |p| p.first_seen_millis);
                        entries.insert(owner.clone(), self.cache(announcement, first_seen, now));
                        events.push(if previous.is_some() {
                            TopologyChange::Updated(owner.clone())
                        } else {
                            TopologyChange::Registered(owner.clone())
                        });
                        (RegistrationOutcome::Registered, events)
                    }
                }
            }
        };
        self.notify(events);
        outcome
    }

    /// Idempotent removal.
    pub fn unregister_announcement(&self, owner_id: &str) -> bool {
        let removed = self.entries.lock().remove(owner_id).is_some();
        if removed {
            tracing::debug!("AnnouncementRegistry: unregistered {}", owner_id);
            self.notify(vec![TopologyChange::Removed(owner_id.to_string())]);
        }
        removed
    }

    /// Appends every active entry the filter accepts to `target.inherited`.
    ///
    /// The filter sees the receiving instance id and the candidate. Entries
    /// are deduplicated by primary key against what `target` already carries,
    /// and the total nested count of `target` is kept within the configured
    /// cap.
    pub fn add_all_except<F>(&self, target: &mut Announcement, filter: F)
    where
        F: Fn(&str, &Announcement) -> bool,
    {
        let now = self.clock.now_millis();
        let (snapshot, events) = {
            let mut entries = self.entries.lock();
            let events = purge_locked(&mut entries, now);
            let mut snapshot: Vec<Announcement> = entries.values().map(|c| c.announcement.clone()).collect();
            snapshot.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
            (snapshot, events)
        };
        self.notify(events);

        let mut present: HashSet<String> = target.inherited.iter().map(|a| a.owner_id.clone()).collect();
        let mut budget = self.max_inherited.saturating_sub(target.nested_count());
        for candidate in snapshot {
            if present.contains(&candidate.owner_id) || !filter(&self.local_instance_id, &candidate) {
                continue;
            }
            let cost = 1 + candidate.nested_count();
            if cost > budget {
                tracing::debug!(
                    "AnnouncementRegistry: inherited cap reached, not relaying {}",
                    candidate.owner_id
                );
                continue;
            }
            budget -= cost;
            present.insert(candidate.owner_id.clone());
            target.inherited.push(candidate);
        }
    }

    pub fn list_local_announcements(&self) -> Vec<Announcement> {
        self.with_active(|entries| {
            let mut out: Vec<Announcement> = entries.values().map(|c| c.announcement.clone()).collect();
            out.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
            out
        })
    }

    /// Entries that peers pinged us with directly (as opposed to ones we
    /// inherited from our own outgoing connectors).
    pub fn list_local_incoming_announcements(&self) -> Vec<CachedAnnouncement> {
        self.with_active(|entries| {
            let mut out: Vec<CachedAnnouncement> = entries
                .values()
                .filter(|c| !c.announcement.is_inherited)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.announcement.owner_id.cmp(&b.announcement.owner_id));
            out
        })
    }

    /// Every instance vouched for by any active entry, deduplicated by id.
    pub fn list_instances(&self) -> Vec<InstanceDescription> {
        self.with_active(|entries| {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for cached in entries.values() {
                for instance in cached.announcement.list_instances() {
                    if seen.insert(instance.id.clone()) {
                        out.push(instance.clone());
                    }
                }
            }
            out.sort_by(|a, b| a.id.cmp(&b.id));
            out
        })
    }

    pub fn has_active_announcement(&self, owner_id: &str) -> bool {
        self.with_active(|entries| entries.contains_key(owner_id))
    }

    pub fn get(&self, owner_id: &str) -> Option<CachedAnnouncement> {
        self.with_active(|entries| entries.get(owner_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.with_active(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries and returns their owners.
    pub fn purge_expired(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let events = purge_locked(&mut self.entries.lock(), now);
        let owners = events.iter().map(|e| e.owner_id().to_string()).collect();
        self.notify(events);
        owners
    }

    fn with_active<R>(&self, f: impl FnOnce(&HashMap<String, CachedAnnouncement>) -> R) -> R {
        let now = self.clock.now_millis();
        let (result, events) = {
            let mut entries = self.entries.lock();
            let events = purge_locked(&mut entries, now);
            (f(&entries), events)
        };
        self.notify(events);
        result
    }

    fn acceptable(&self, announcement: &Announcement) -> bool {
        if !announcement.is_valid() {
            tracing::warn!("AnnouncementRegistry: ignoring invalid announcement from {:?}", announcement.owner_id);
            return false;
        }
        if announcement.r#loop {
            return false;
        }
        if announcement.owner_id == self.local_instance_id {
            tracing::info!("AnnouncementRegistry: refusing announcement owned by the local instance");
            return false;
        }
        true
    }

    fn cache(&self, announcement: Announcement, first_seen: u64, now: u64) -> CachedAnnouncement {
        CachedAnnouncement {
            announcement,
            first_seen_millis: first_seen,
            last_ping_millis: now,
            expires_at_millis: now + self.timeout_millis,
        }
    }

    fn notify(&self, events: Vec<TopologyChange>) {
        for event in events {
            self.listener.topology_changed(event);
        }
    }
}

fn purge_locked(entries: &mut HashMap<String, CachedAnnouncement>, now: u64) -> Vec<TopologyChange> {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, cached)| cached.has_expired(now))
        .map(|(owner, _)| owner.clone())
        .collect();
    for owner in &expired {
        entries.remove(owner);
        tracing::info!("AnnouncementRegistry: announcement of {} expired", owner);
    }
    expired.into_iter().map(TopologyChange::Expired).collect()
}

/// True if `owner` appears as an instance inside any entry not owned by it.
fn attached_elsewhere(entries: &HashMap<String, CachedAnnouncement>, owner: &str) -> bool {
    entries
        .values()
        .filter(|c| c.announcement.owner_id != owner)
        .any(|c| c.announcement.list_instances().iter().any(|i| i.id == owner))
}
