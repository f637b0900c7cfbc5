//! Widget registry
//!
//! Owns the set of registered widgets, each widget's channel memberships and
//! its subscriptions. Pure bookkeeping: the registry never invokes handlers
//! and never takes locks; the broker wraps it in one mutex and the router
//! snapshots subscriptions out of it before delivering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::message::MessageEnvelope;
use crate::pattern::Pattern;

/// Handler invoked for each matching envelope delivered to a widget
pub type MessageHandler = Arc<dyn Fn(&MessageEnvelope) -> eyre::Result<()> + Send + Sync>;

/// Registration input
#[derive(Debug, Clone, Default)]
pub struct WidgetDescriptor {
    /// Caller-supplied id; generated when absent
    pub id: Option<String>,
    /// Display type (e.g. "chart", "table")
    pub widget_type: Option<String>,
    /// Display title
    pub title: Option<String>,
}

/// One (pattern, handler) pair owned by exactly one widget
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub pattern: Pattern,
    pub handler: MessageHandler,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// One registered widget
#[derive(Debug)]
pub struct Widget {
    pub id: String,
    pub widget_type: Option<String>,
    pub title: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// Channels this widget currently belongs to
    pub channels: HashSet<String>,
    /// Subscription id -> subscription
    subscriptions: HashMap<String, Subscription>,
}

/// The set of registered widgets
#[derive(Debug, Default)]
pub struct WidgetRegistry {
    widgets: HashMap<String, Widget>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a widget, assigning an id when the descriptor carries none
    ///
    /// Re-registering an existing id replaces the previous record. Never
    /// fails; returns the effective widget id.
    pub fn register(&mut self, descriptor: WidgetDescriptor) -> String {
        let id = descriptor.id.unwrap_or_else(|| Uuid::now_v7().to_string());
        debug!(widget_id = %id, "Registering widget");
        self.widgets.insert(
            id.clone(),
            Widget {
                id: id.clone(),
                widget_type: descriptor.widget_type,
                title: descriptor.title,
                registered_at: Utc::now(),
                channels: HashSet::new(),
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    /// Remove a widget record; idempotent
    ///
    /// Returns the removed record so the broker can cascade channel leaves.
    pub fn unregister(&mut self, widget_id: &str) -> Option<Widget> {
        debug!(widget_id = %widget_id, "Unregistering widget");
        self.widgets.remove(widget_id)
    }

    pub fn exists(&self, widget_id: &str) -> bool {
        self.widgets.contains_key(widget_id)
    }

    pub fn get(&self, widget_id: &str) -> Option<&Widget> {
        self.widgets.get(widget_id)
    }

    pub fn get_mut(&mut self, widget_id: &str) -> Option<&mut Widget> {
        self.widgets.get_mut(widget_id)
    }

    /// Ids of all registered widgets
    pub fn ids(&self) -> Vec<String> {
        self.widgets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    /// Attach a subscription to a widget
    pub fn add_subscription(
        &mut self,
        widget_id: &str,
        pattern: Pattern,
        handler: MessageHandler,
    ) -> Option<String> {
        let widget = self.widgets.get_mut(widget_id)?;
        let sub_id = Uuid::now_v7().to_string();
        debug!(widget_id = %widget_id, sub_id = %sub_id, "Adding subscription");
        widget.subscriptions.insert(
            sub_id.clone(),
            Subscription {
                id: sub_id.clone(),
                pattern,
                handler,
            },
        );
        Some(sub_id)
    }

    /// Detach a subscription; returns whether it existed
    pub fn remove_subscription(&mut self, widget_id: &str, sub_id: &str) -> bool {
        self.widgets
            .get_mut(widget_id)
            .is_some_and(|w| w.subscriptions.remove(sub_id).is_some())
    }

    /// Clone a widget's subscriptions for lock-free iteration during delivery
    pub fn subscriptions_snapshot(&self, widget_id: &str) -> Vec<Subscription> {
        self.widgets
            .get(widget_id)
            .map(|w| w.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> MessageHandler {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn test_register_assigns_id_when_absent() {
        let mut registry = WidgetRegistry::new();
        let id = registry.register(WidgetDescriptor::default());
        assert!(!id.is_empty());
        assert!(registry.exists(&id));
    }

    #[test]
    fn test_register_keeps_supplied_id() {
        let mut registry = WidgetRegistry::new();
        let id = registry.register(WidgetDescriptor {
            id: Some("chart-1".to_string()),
            widget_type: Some("chart".to_string()),
            title: Some("CPU".to_string()),
        });
        assert_eq!(id, "chart-1");
        let widget = registry.get("chart-1").unwrap();
        assert_eq!(widget.widget_type.as_deref(), Some("chart"));
    }

    #[test]
    fn test_reregister_replaces_record() {
        let mut registry = WidgetRegistry::new();
        registry.register(WidgetDescriptor {
            id: Some("w1".to_string()),
            title: Some("old".to_string()),
            ..Default::default()
        });
        registry.register(WidgetDescriptor {
            id: Some("w1".to_string()),
            title: Some("new".to_string()),
            ..Default::default()
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("w1").unwrap().title.as_deref(), Some("new"));
    }

    #[test]
    fn test_unregister_idempotent() {
        let mut registry = WidgetRegistry::new();
        registry.register(WidgetDescriptor {
            id: Some("w1".to_string()),
            ..Default::default()
        });
        assert!(registry.unregister("w1").is_some());
        assert!(registry.unregister("w1").is_none());
        assert!(!registry.exists("w1"));
    }

    #[test]
    fn test_subscription_lifecycle() {
        let mut registry = WidgetRegistry::new();
        registry.register(WidgetDescriptor {
            id: Some("w1".to_string()),
            ..Default::default()
        });

        let sub_id = registry
            .add_subscription("w1", Pattern::exact("ping"), noop_handler())
            .unwrap();
        assert_eq!(registry.subscriptions_snapshot("w1").len(), 1);

        assert!(registry.remove_subscription("w1", &sub_id));
        assert!(!registry.remove_subscription("w1", &sub_id));
        assert!(registry.subscriptions_snapshot("w1").is_empty());
    }

    #[test]
    fn test_subscription_on_unknown_widget() {
        let mut registry = WidgetRegistry::new();
        assert!(registry.add_subscription("ghost", Pattern::exact("x"), noop_handler()).is_none());
        assert!(registry.subscriptions_snapshot("ghost").is_empty());
    }
}
