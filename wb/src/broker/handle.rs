//! WidgetHandle - per-widget capability surface
//!
//! Every operation is scoped to the widget id the handle was registered
//! with. The handle is cheap to clone; clones share the widget's local event
//! emitter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{ChannelInfo, ChannelOptions};
use crate::error::BrokerError;
use crate::lock_unpoisoned;
use crate::message::{MessageEnvelope, Target};
use crate::metrics::BrokerMetrics;
use crate::pattern::Pattern;
use crate::state::{StateChange, StateHandler};
use crate::sync::ConflictPolicy;

use super::core::BrokerCore;

/// Handler for widget-local events (`emit`/`on`)
pub type LocalHandler = Arc<dyn Fn(&Value) -> eyre::Result<()> + Send + Sync>;

struct LocalSubscription {
    id: String,
    handler: LocalHandler,
}

/// A widget's view of the broker
#[derive(Clone)]
pub struct WidgetHandle {
    core: Arc<BrokerCore>,
    widget_id: String,
    /// Widget-local event handlers, shared across clones of this handle
    local: Arc<Mutex<HashMap<String, Vec<LocalSubscription>>>>,
}

impl WidgetHandle {
    pub(crate) fn new(core: Arc<BrokerCore>, widget_id: String) -> Self {
        debug!(widget_id = %widget_id, "WidgetHandle created");
        Self {
            core,
            widget_id,
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// This handle's widget id
    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    // === Channels ===

    /// Create a channel with this widget as its first member
    pub fn create_channel(&self, name: &str, options: ChannelOptions) -> Result<(), BrokerError> {
        self.core.create_channel(&self.widget_id, name, options)
    }

    /// Join a channel; buffered history is replayed to this widget
    pub fn join_channel(&self, name: &str) -> Result<(), BrokerError> {
        self.core.join_channel(&self.widget_id, name)
    }

    /// Leave a channel; no-op when not a member
    pub fn leave_channel(&self, name: &str) {
        self.core.leave_channel(&self.widget_id, name);
    }

    /// Summaries of all channels
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.core.list_channels()
    }

    // === Messaging ===

    /// Send a payload to a target; returns the message id
    pub fn send(&self, target: Target, message: Value) -> Result<String, BrokerError> {
        self.core.router.send(&self.widget_id, target, message)
    }

    /// Send a payload to every other registered widget
    pub fn broadcast(&self, message: Value) -> Result<String, BrokerError> {
        self.send(Target::Broadcast, message)
    }

    /// Send a request and wait for a correlated response or a timeout
    pub async fn request(
        &self,
        target: Target,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BrokerError> {
        self.core
            .requests
            .request(&self.widget_id, target, payload, timeout)
            .await
    }

    /// Settle a pending request this widget received
    pub fn respond(&self, request_id: &str, response: Value) -> Result<(), BrokerError> {
        self.core.requests.respond(&self.widget_id, request_id, response)
    }

    /// Subscribe to incoming envelopes matching a pattern
    pub fn subscribe(
        &self,
        pattern: Pattern,
        handler: impl Fn(&MessageEnvelope) -> eyre::Result<()> + Send + Sync + 'static,
    ) -> Result<String, BrokerError> {
        lock_unpoisoned(&self.core.registry)
            .add_subscription(&self.widget_id, pattern, Arc::new(handler))
            .ok_or_else(|| BrokerError::WidgetNotRegistered(self.widget_id.clone()))
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        lock_unpoisoned(&self.core.registry).remove_subscription(&self.widget_id, sub_id)
    }

    // === Shared state ===

    /// Latest value under a key
    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.core.state.get(key)
    }

    /// Overwrite a key and notify its subscribers
    pub fn state_set(&self, key: &str, value: Value) -> Value {
        self.core.state.set(&self.widget_id, key, value)
    }

    /// Apply a pure function to the current value and store the result
    pub fn state_update(&self, key: &str, updater: impl FnOnce(Option<&Value>) -> Value) -> Value {
        self.core.state.update(&self.widget_id, key, updater)
    }

    /// Subscribe to a key; the current value (when set) arrives immediately
    /// as an `Initial` event
    pub fn subscribe_state(
        &self,
        key: &str,
        handler: impl Fn(&StateChange) -> eyre::Result<()> + Send + Sync + 'static,
    ) -> String {
        let handler: StateHandler = Arc::new(handler);
        self.core.state.subscribe(&self.widget_id, key, handler)
    }

    /// Remove a state subscription; returns whether it existed
    pub fn unsubscribe_state(&self, sub_id: &str) -> bool {
        self.core.state.unsubscribe(sub_id)
    }

    // === Sync groups ===

    /// Register an empty sync group
    pub fn create_sync_group(&self, group_id: &str, policy: ConflictPolicy) -> Result<(), BrokerError> {
        self.core.sync.create_group(group_id, policy)
    }

    /// Join a sync group; the full state snapshot is delivered to this widget
    pub fn join_sync_group(&self, group_id: &str) -> Result<(), BrokerError> {
        self.core.sync.join(&self.widget_id, group_id)
    }

    /// Write a key into a sync group; returns the accepted version
    pub fn sync_data(&self, group_id: &str, key: &str, value: Value) -> Result<u64, BrokerError> {
        self.core.sync.sync_data(&self.widget_id, group_id, key, value)
    }

    // === Local events ===

    /// Attach a handler to a widget-local event
    pub fn on(&self, event: &str, handler: impl Fn(&Value) -> eyre::Result<()> + Send + Sync + 'static) -> String {
        let sub_id = Uuid::now_v7().to_string();
        lock_unpoisoned(&self.local)
            .entry(event.to_string())
            .or_default()
            .push(LocalSubscription {
                id: sub_id.clone(),
                handler: Arc::new(handler),
            });
        sub_id
    }

    /// Detach a local event handler; returns whether it existed
    pub fn off(&self, event: &str, sub_id: &str) -> bool {
        let mut local = lock_unpoisoned(&self.local);
        let Some(subs) = local.get_mut(event) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != sub_id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            local.remove(event);
        }
        removed
    }

    /// Fire a widget-local event synchronously
    pub fn emit(&self, event: &str, data: &Value) {
        let snapshot: Vec<(String, LocalHandler)> = lock_unpoisoned(&self.local)
            .get(event)
            .map(|subs| subs.iter().map(|s| (s.id.clone(), s.handler.clone())).collect())
            .unwrap_or_default();

        for (sub_id, handler) in snapshot {
            if let Err(e) = handler(data) {
                self.core.metrics.record_handler_error();
                warn!(
                    widget_id = %self.widget_id,
                    event = %event,
                    sub_id = %sub_id,
                    error = %e,
                    "Local event handler failed"
                );
            }
        }
    }

    // === Lifecycle ===

    /// Current broker metrics
    pub fn metrics(&self) -> BrokerMetrics {
        self.core.metrics()
    }

    /// Unregister this widget, cascading channel leaves and subscription
    /// cleanup; idempotent
    pub fn dispose(&self) {
        self.core.unregister(&self.widget_id);
    }
}

impl std::fmt::Debug for WidgetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetHandle")
            .field("widget_id", &self.widget_id)
            .finish_non_exhaustive()
    }
}
