//! Sync group manager
//!
//! Multi-widget data replication layered on the router's direct-delivery
//! path. Each accepted write bumps the group version by one and fans out an
//! independent `sync:update` to every other member. Fan-out is not an atomic
//! broadcast: a member whose own write races an incoming remote write may
//! transiently observe a version gap. Both interleavings are legal; the group
//! is eventually consistent with no causal ordering across members.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::BrokerError;
use crate::lock_unpoisoned;
use crate::router::Router;

/// Sender id used for broker-authored notifications (sync snapshots)
pub const SYSTEM_SENDER: &str = "system";

/// Per-key conflict policy
///
/// Declared for forward compatibility; only last-write-wins (by acceptance
/// order, not by timestamp) is implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    LastWriteWins,
}

/// One replicated value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub value: Value,
    pub updated_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct SyncGroup {
    members: HashSet<String>,
    data: HashMap<String, SyncEntry>,
    version: u64,
    #[allow(dead_code)]
    policy: ConflictPolicy,
}

/// Owns the sync groups of one broker instance
pub struct SyncGroupManager {
    groups: Mutex<HashMap<String, SyncGroup>>,
    router: Arc<Router>,
}

impl SyncGroupManager {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            router,
        }
    }

    /// Register an empty group
    pub fn create_group(&self, group_id: &str, policy: ConflictPolicy) -> Result<(), BrokerError> {
        let mut groups = lock_unpoisoned(&self.groups);
        if groups.contains_key(group_id) {
            return Err(BrokerError::SyncGroupExists(group_id.to_string()));
        }
        debug!(group_id = %group_id, ?policy, "Creating sync group");
        groups.insert(
            group_id.to_string(),
            SyncGroup {
                members: HashSet::new(),
                data: HashMap::new(),
                version: 0,
                policy,
            },
        );
        Ok(())
    }

    /// Add a member and deliver the full state snapshot to it
    ///
    /// The snapshot is how late joiners converge to current group state.
    pub fn join(&self, widget_id: &str, group_id: &str) -> Result<(), BrokerError> {
        let (data, version) = {
            let mut groups = lock_unpoisoned(&self.groups);
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| BrokerError::SyncGroupNotFound(group_id.to_string()))?;
            group.members.insert(widget_id.to_string());
            (group.data.clone(), group.version)
        };

        debug!(widget_id = %widget_id, group_id = %group_id, version, "Widget joined sync group");
        self.router.notify(
            widget_id,
            SYSTEM_SENDER,
            json!({
                "type": "sync:state",
                "group": group_id,
                "data": serde_json::to_value(&data).unwrap_or_default(),
                "version": version,
            }),
        );
        Ok(())
    }

    /// Record a write, bump the version, and fan out to the other members
    ///
    /// Returns the version assigned to this write.
    pub fn sync_data(
        &self,
        widget_id: &str,
        group_id: &str,
        key: &str,
        value: Value,
    ) -> Result<u64, BrokerError> {
        let (version, others) = {
            let mut groups = lock_unpoisoned(&self.groups);
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| BrokerError::SyncGroupNotFound(group_id.to_string()))?;
            if !group.members.contains(widget_id) {
                return Err(BrokerError::NotASyncGroupMember {
                    widget_id: widget_id.to_string(),
                    group_id: group_id.to_string(),
                });
            }

            group.data.insert(
                key.to_string(),
                SyncEntry {
                    value: value.clone(),
                    updated_by: widget_id.to_string(),
                    timestamp: Utc::now(),
                },
            );
            group.version += 1;

            let others: Vec<String> = group
                .members
                .iter()
                .filter(|m| m.as_str() != widget_id)
                .cloned()
                .collect();
            (group.version, others)
        };

        debug!(widget_id = %widget_id, group_id = %group_id, key = %key, version, "Sync write accepted");

        // Independent per-member delivery, in acceptance order for this group
        for member in others {
            self.router.notify(
                &member,
                widget_id,
                json!({
                    "type": "sync:update",
                    "group": group_id,
                    "key": key,
                    "value": value,
                    "version": version,
                }),
            );
        }
        Ok(version)
    }

    /// Current data map and version of a group
    pub fn snapshot(&self, group_id: &str) -> Result<(HashMap<String, SyncEntry>, u64), BrokerError> {
        let groups = lock_unpoisoned(&self.groups);
        let group = groups
            .get(group_id)
            .ok_or_else(|| BrokerError::SyncGroupNotFound(group_id.to_string()))?;
        Ok((group.data.clone(), group.version))
    }

    /// Drop a widget's memberships (unregister cascade)
    pub fn remove_widget(&self, widget_id: &str) {
        for group in lock_unpoisoned(&self.groups).values_mut() {
            group.members.remove(widget_id);
        }
    }

    pub fn group_count(&self) -> usize {
        lock_unpoisoned(&self.groups).len()
    }

    /// Wipe all groups (broker teardown)
    pub fn clear(&self) {
        lock_unpoisoned(&self.groups).clear();
    }
}
