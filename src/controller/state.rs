//! Registry of managed ingresses and the lock that guards it
//!
//! [`SharedState`] is the single reader/writer lock over the registry and
//! sync bookkeeping. Convergence passes and drift resyncs hold the write
//! guard for their whole duration; exports and health checks take the read
//! guard, so readers only ever observe committed state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

use super::retry::RetryBook;
use crate::ingress::{ManagedResource, ResourceId};

/// Ordered set of managed resources, unique by id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registry {
    entries: BTreeMap<ResourceId, ManagedResource>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ManagedResource> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or replace the entry for `resource.id`
    pub fn insert(&mut self, resource: ManagedResource) -> Option<ManagedResource> {
        self.entries.insert(resource.id.clone(), resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedResource> {
        self.entries.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.entries.keys()
    }

    /// Entries of `self` that are absent from `current`, with their desired
    /// state cleared so the reconciler tears them down.
    pub fn removed(&self, current: &Registry) -> Vec<ManagedResource> {
        self.entries
            .values()
            .filter(|r| !current.contains(&r.id))
            .cloned()
            .map(ManagedResource::into_removal)
            .collect()
    }

    /// Drop every entry without a live handle, returning what was dropped
    pub fn retain_live(&mut self) -> Vec<ManagedResource> {
        let (live, dropped): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(_, r)| r.is_live());
        self.entries = live;
        dropped.into_values().collect()
    }

    pub fn namespace_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for resource in self.entries.values() {
            *counts.entry(resource.namespace().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_vec(&self) -> Vec<ManagedResource> {
        self.entries.values().cloned().collect()
    }
}

impl FromIterator<ManagedResource> for Registry {
    fn from_iter<I: IntoIterator<Item = ManagedResource>>(iter: I) -> Self {
        let mut registry = Registry::new();
        for resource in iter {
            registry.insert(resource);
        }
        registry
    }
}

impl Extend<ManagedResource> for Registry {
    fn extend<I: IntoIterator<Item = ManagedResource>>(&mut self, iter: I) {
        for resource in iter {
            self.insert(resource);
        }
    }
}

/// Registry plus the bookkeeping that must change atomically with it
#[derive(Debug, Default)]
pub struct SyncState {
    pub registry: Registry,
    /// Completion time of the last convergence pass, for the watchdog
    pub last_update: Option<Instant>,
    /// Wall-clock twin of `last_update`, for exports
    pub last_update_at: Option<DateTime<Utc>>,
    /// Completion time of the last drift resync
    pub last_resync_at: Option<DateTime<Utc>>,
    /// Resources tracked per namespace after the last committed pass
    pub namespace_counts: BTreeMap<String, usize>,
    pub retries: RetryBook,
    /// Completed convergence passes
    pub passes: u64,
}

/// Exclusive-access handle over [`SyncState`]
#[derive(Clone, Debug, Default)]
pub struct SharedState {
    inner: Arc<RwLock<SyncState>>,
}

impl SharedState {
    pub fn new(state: SyncState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Shared access; concurrent readers do not block each other
    pub async fn read(&self) -> RwLockReadGuard<'_, SyncState> {
        self.inner.read().await
    }

    /// Exclusive access for convergence passes and drift resyncs
    pub async fn write(&self) -> RwLockWriteGuard<'_, SyncState> {
        self.inner.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{desired_spec, live};
    use crate::ingress::ExternalHandle;

    #[test]
    fn test_removed_clears_desired_state() {
        let prior: Registry = [live("default", "a"), live("default", "b"), live("shop", "c")]
            .into_iter()
            .collect();
        let current: Registry = [live("default", "a")].into_iter().collect();

        let removed = prior.removed(&current);
        let ids: Vec<String> = removed.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["default/b", "shop/c"]);
        assert!(removed.iter().all(|r| r.is_removal()));
        assert!(removed.iter().all(|r| r.handle.is_some()));
    }

    #[test]
    fn test_retain_live_drops_deleted_and_unprovisioned() {
        let mut deleted = live("default", "gone");
        deleted.handle = Some(ExternalHandle {
            arn: "arn:gone".into(),
            dns_name: None,
            deleted: true,
        });
        let mut unprovisioned = ManagedResource::new(ResourceId::new("default", "new"));
        unprovisioned.desired = Some(desired_spec("prod-new"));

        let mut registry: Registry = [live("default", "kept"), deleted, unprovisioned]
            .into_iter()
            .collect();
        let dropped = registry.retain_live();

        assert_eq!(dropped.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&ResourceId::new("default", "kept")));
    }

    #[test]
    fn test_namespace_counts() {
        let registry: Registry = [live("default", "a"), live("default", "b"), live("shop", "c")]
            .into_iter()
            .collect();
        let counts = registry.namespace_counts();
        assert_eq!(counts.get("default"), Some(&2));
        assert_eq!(counts.get("shop"), Some(&1));
    }

    #[tokio::test]
    async fn test_readers_share_the_lock() {
        let state = SharedState::default();
        let first = state.read().await;
        let second = state.read().await;
        assert_eq!(first.passes, second.passes);
    }
}
