//! Shared state store
//!
//! A global key/value space with synchronous change notification. Independent
//! of channels: widgets subscribe to keys directly. Subscribing to a key that
//! already holds a value delivers one `Initial` event before any `Set`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::lock_unpoisoned;
use crate::metrics::MetricsCollector;

/// Handler invoked for state change notifications
pub type StateHandler = Arc<dyn Fn(&StateChange) -> eyre::Result<()> + Send + Sync>;

/// Why a state notification fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateChangeKind {
    /// Current value delivered once at subscription time
    Initial,
    /// A write happened
    Set,
}

/// A state change notification
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    #[serde(rename = "type")]
    pub kind: StateChangeKind,
    pub key: String,
    pub value: Value,
    /// Value replaced by a `Set`; absent for `Initial` and first writes
    pub old_value: Option<Value>,
    /// Writer widget id; absent for `Initial`
    pub updated_by: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StateEntry {
    value: Value,
    #[allow(dead_code)]
    updated_by: String,
    updated_at: DateTime<Utc>,
}

#[derive(Clone)]
struct StateSubscription {
    id: String,
    widget_id: String,
    handler: StateHandler,
}

/// The global key/value space of one broker instance
pub struct SharedState {
    entries: Mutex<HashMap<String, StateEntry>>,
    /// key -> subscriptions on that key
    subscribers: Mutex<HashMap<String, Vec<StateSubscription>>>,
    metrics: Arc<MetricsCollector>,
}

impl SharedState {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Latest written value under a key
    pub fn get(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.entries).get(key).map(|e| e.value.clone())
    }

    /// Overwrite a key unconditionally and notify its subscribers
    pub fn set(&self, widget_id: &str, key: &str, value: Value) -> Value {
        let now = Utc::now();
        let old_value = lock_unpoisoned(&self.entries)
            .insert(
                key.to_string(),
                StateEntry {
                    value: value.clone(),
                    updated_by: widget_id.to_string(),
                    updated_at: now,
                },
            )
            .map(|e| e.value);

        debug!(key = %key, widget_id = %widget_id, "State set");
        self.notify(&StateChange {
            kind: StateChangeKind::Set,
            key: key.to_string(),
            value: value.clone(),
            old_value,
            updated_by: Some(widget_id.to_string()),
            timestamp: now,
        });
        value
    }

    /// Apply a pure function to the current value and store the result
    ///
    /// The updater runs under the store lock to keep notification ordering
    /// deterministic; it must not call back into the broker.
    pub fn update(
        &self,
        widget_id: &str,
        key: &str,
        updater: impl FnOnce(Option<&Value>) -> Value,
    ) -> Value {
        let now = Utc::now();
        let (value, old_value) = {
            let mut entries = lock_unpoisoned(&self.entries);
            let value = updater(entries.get(key).map(|e| &e.value));
            let old_value = entries
                .insert(
                    key.to_string(),
                    StateEntry {
                        value: value.clone(),
                        updated_by: widget_id.to_string(),
                        updated_at: now,
                    },
                )
                .map(|e| e.value);
            (value, old_value)
        };

        debug!(key = %key, widget_id = %widget_id, "State update");
        self.notify(&StateChange {
            kind: StateChangeKind::Set,
            key: key.to_string(),
            value: value.clone(),
            old_value,
            updated_by: Some(widget_id.to_string()),
            timestamp: now,
        });
        value
    }

    /// Subscribe to a key; delivers the current value immediately when set
    pub fn subscribe(&self, widget_id: &str, key: &str, handler: StateHandler) -> String {
        let sub_id = Uuid::now_v7().to_string();
        lock_unpoisoned(&self.subscribers)
            .entry(key.to_string())
            .or_default()
            .push(StateSubscription {
                id: sub_id.clone(),
                widget_id: widget_id.to_string(),
                handler: handler.clone(),
            });
        debug!(key = %key, widget_id = %widget_id, sub_id = %sub_id, "State subscription added");

        // Initial event establishes the starting point before any Set arrives
        let current = lock_unpoisoned(&self.entries).get(key).cloned();
        if let Some(entry) = current {
            let change = StateChange {
                kind: StateChangeKind::Initial,
                key: key.to_string(),
                value: entry.value,
                old_value: None,
                updated_by: None,
                timestamp: entry.updated_at,
            };
            self.invoke(widget_id, &sub_id, &handler, &change);
        }
        sub_id
    }

    /// Remove one state subscription; returns whether it existed
    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        let mut subscribers = lock_unpoisoned(&self.subscribers);
        let mut found = false;
        subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != sub_id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    /// Drop all of a widget's state subscriptions (unregister cascade)
    pub fn remove_widget(&self, widget_id: &str) {
        let mut subscribers = lock_unpoisoned(&self.subscribers);
        subscribers.retain(|_, subs| {
            subs.retain(|s| s.widget_id != widget_id);
            !subs.is_empty()
        });
    }

    /// Wipe all entries and subscriptions (broker teardown)
    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
        lock_unpoisoned(&self.subscribers).clear();
    }

    fn notify(&self, change: &StateChange) {
        // Snapshot before invoking: handlers may subscribe/unsubscribe
        let snapshot: Vec<StateSubscription> = lock_unpoisoned(&self.subscribers)
            .get(&change.key)
            .cloned()
            .unwrap_or_default();

        for sub in snapshot {
            self.invoke(&sub.widget_id, &sub.id, &sub.handler, change);
        }
    }

    fn invoke(&self, widget_id: &str, sub_id: &str, handler: &StateHandler, change: &StateChange) {
        if let Err(e) = handler(change) {
            self.metrics.record_handler_error();
            warn!(
                widget_id = %widget_id,
                sub_id = %sub_id,
                key = %change.key,
                error = %e,
                "State handler failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (SharedState, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        (SharedState::new(metrics.clone()), metrics)
    }

    fn recording_handler() -> (StateHandler, Arc<Mutex<Vec<StateChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let handler: StateHandler = Arc::new(move |change| {
            lock_unpoisoned(&captured).push(change.clone());
            Ok(())
        });
        (handler, seen)
    }

    #[test]
    fn test_get_set_roundtrip() {
        let (state, _) = setup();
        assert!(state.get("theme").is_none());
        state.set("w1", "theme", json!("dark"));
        assert_eq!(state.get("theme"), Some(json!("dark")));
    }

    #[test]
    fn test_set_notifies_with_old_value() {
        let (state, _) = setup();
        let (handler, seen) = recording_handler();
        state.subscribe("w2", "theme", handler);

        state.set("w1", "theme", json!("dark"));
        state.set("w1", "theme", json!("light"));

        let seen = lock_unpoisoned(&seen);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind, StateChangeKind::Set);
        assert_eq!(seen[0].old_value, None);
        assert_eq!(seen[1].value, json!("light"));
        assert_eq!(seen[1].old_value, Some(json!("dark")));
        assert_eq!(seen[1].updated_by.as_deref(), Some("w1"));
    }

    #[test]
    fn test_initial_event_on_subscribe() {
        let (state, _) = setup();
        state.set("w1", "count", json!(7));

        let (handler, seen) = recording_handler();
        state.subscribe("w2", "count", handler);

        let seen = lock_unpoisoned(&seen);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, StateChangeKind::Initial);
        assert_eq!(seen[0].value, json!(7));
        assert_eq!(seen[0].old_value, None);
        assert_eq!(seen[0].updated_by, None);
    }

    #[test]
    fn test_no_initial_event_for_unset_key() {
        let (state, _) = setup();
        let (handler, seen) = recording_handler();
        state.subscribe("w2", "missing", handler);
        assert!(lock_unpoisoned(&seen).is_empty());
    }

    #[test]
    fn test_update_applies_to_current_value() {
        let (state, _) = setup();
        state.set("w1", "count", json!(2));
        let result = state.update("w2", "count", |current| {
            json!(current.and_then(|v| v.as_i64()).unwrap_or(0) + 5)
        });
        assert_eq!(result, json!(7));
        assert_eq!(state.get("count"), Some(json!(7)));

        // Updater on a missing key sees None
        state.update("w2", "fresh", |current| json!(current.is_none()));
        assert_eq!(state.get("fresh"), Some(json!(true)));
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let (state, _) = setup();
        let (handler, seen) = recording_handler();
        let sub_id = state.subscribe("w2", "theme", handler);

        assert!(state.unsubscribe(&sub_id));
        assert!(!state.unsubscribe(&sub_id));

        state.set("w1", "theme", json!("dark"));
        assert!(lock_unpoisoned(&seen).is_empty());
    }

    #[test]
    fn test_remove_widget_drops_its_subscriptions() {
        let (state, _) = setup();
        let (handler_a, seen_a) = recording_handler();
        let (handler_b, seen_b) = recording_handler();
        state.subscribe("w-gone", "theme", handler_a);
        state.subscribe("w-stays", "theme", handler_b);

        state.remove_widget("w-gone");
        state.set("w1", "theme", json!("dark"));

        assert!(lock_unpoisoned(&seen_a).is_empty());
        assert_eq!(lock_unpoisoned(&seen_b).len(), 1);
    }

    #[test]
    fn test_failing_handler_counted_and_isolated() {
        let (state, metrics) = setup();
        state.subscribe("w2", "theme", Arc::new(|_| Err(eyre::eyre!("bad handler"))));
        let (handler, seen) = recording_handler();
        state.subscribe("w3", "theme", handler);

        state.set("w1", "theme", json!("dark"));

        assert_eq!(metrics.snapshot().handler_errors, 1);
        assert_eq!(lock_unpoisoned(&seen).len(), 1);
    }
}
