//! Read-only views of committed controller state

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::SyncState;
use crate::ingress::ManagedResource;

/// One managed resource together with its retry bookkeeping
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    #[serde(flatten)]
    pub resource: ManagedResource,
    #[serde(skip_serializing_if = "is_zero")]
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Point-in-time copy of the registry
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub last_update: Option<DateTime<Utc>>,
    pub last_resync: Option<DateTime<Utc>>,
    pub passes: u64,
    pub namespaces: BTreeMap<String, usize>,
    pub ingresses: Vec<ResourceSnapshot>,
}

/// Copy the committed state; callers hold at least the read guard
pub fn snapshot(state: &SyncState) -> RegistrySnapshot {
    let ingresses = state
        .registry
        .iter()
        .map(|resource| ResourceSnapshot {
            resource: resource.clone(),
            consecutive_failures: state.retries.failures(&resource.id),
            last_error: state.retries.last_error(&resource.id).map(str::to_string),
        })
        .collect();

    RegistrySnapshot {
        last_update: state.last_update_at,
        last_resync: state.last_resync_at,
        passes: state.passes,
        namespaces: state.namespace_counts.clone(),
        ingresses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::live;

    #[test]
    fn test_snapshot_mirrors_registry() {
        let mut state = SyncState::default();
        state.registry = [live("default", "a"), live("shop", "b")].into_iter().collect();
        state.namespace_counts = state.registry.namespace_counts();
        state.passes = 3;

        let snap = snapshot(&state);
        assert_eq!(snap.passes, 3);
        assert_eq!(snap.ingresses.len(), 2);
        assert_eq!(snap.namespaces.get("shop"), Some(&1));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["ingresses"][0]["id"]["namespace"], "default");
        assert!(json["ingresses"][0].get("consecutiveFailures").is_none());
    }
}
