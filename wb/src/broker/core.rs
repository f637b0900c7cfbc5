//! Broker construction, channel orchestration, and lifecycle cascades

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::channel::{ChannelInfo, ChannelManager, ChannelOptions};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::lock_unpoisoned;
use crate::message::LifecycleEvent;
use crate::metrics::{BrokerMetrics, MetricsCollector};
use crate::registry::{WidgetDescriptor, WidgetRegistry};
use crate::request::RequestCoordinator;
use crate::router::{Router, SendRecord};
use crate::state::SharedState;
use crate::sync::SyncGroupManager;

use super::handle::WidgetHandle;

/// Lifecycle event channel capacity
const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

/// Everything one broker instance owns
///
/// Components are constructed explicitly and passed to their dependents, so
/// multiple independent brokers can coexist in one process.
pub(crate) struct BrokerCore {
    pub(crate) registry: Arc<Mutex<WidgetRegistry>>,
    pub(crate) channels: Arc<Mutex<ChannelManager>>,
    pub(crate) router: Arc<Router>,
    pub(crate) requests: Arc<RequestCoordinator>,
    pub(crate) state: Arc<SharedState>,
    pub(crate) sync: Arc<SyncGroupManager>,
    pub(crate) metrics: Arc<MetricsCollector>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl BrokerCore {
    fn emit(&self, event: LifecycleEvent) {
        // Fire-and-forget: no subscribers is fine
        let _ = self.lifecycle.send(event);
    }

    /// Create a channel with the calling widget as its first member
    pub(crate) fn create_channel(
        &self,
        widget_id: &str,
        name: &str,
        options: ChannelOptions,
    ) -> Result<(), BrokerError> {
        {
            let mut registry = lock_unpoisoned(&self.registry);
            let widget = registry
                .get_mut(widget_id)
                .ok_or_else(|| BrokerError::WidgetNotRegistered(widget_id.to_string()))?;
            lock_unpoisoned(&self.channels).create(widget_id, name, options)?;
            widget.channels.insert(name.to_string());
        }
        self.emit(LifecycleEvent::ChannelCreated {
            name: name.to_string(),
            created_by: widget_id.to_string(),
        });
        Ok(())
    }

    /// Join a channel: memberJoined fan-out to prior members, history replay
    /// to the joiner only
    pub(crate) fn join_channel(&self, widget_id: &str, name: &str) -> Result<(), BrokerError> {
        let outcome = {
            let mut registry = lock_unpoisoned(&self.registry);
            let widget = registry
                .get_mut(widget_id)
                .ok_or_else(|| BrokerError::WidgetNotRegistered(widget_id.to_string()))?;
            let outcome = lock_unpoisoned(&self.channels).join(widget_id, name)?;
            widget.channels.insert(name.to_string());
            outcome
        };

        for member in &outcome.prior_members {
            self.router.notify(
                member,
                widget_id,
                json!({"type": "memberJoined", "channel": name, "widgetId": widget_id}),
            );
        }
        for envelope in &outcome.replay {
            self.router.deliver_to(widget_id, envelope);
        }
        Ok(())
    }

    /// Leave a channel; no-op when not a member
    pub(crate) fn leave_channel(&self, widget_id: &str, name: &str) {
        let outcome = lock_unpoisoned(&self.channels).leave(widget_id, name);
        if let Some(widget) = lock_unpoisoned(&self.registry).get_mut(widget_id) {
            widget.channels.remove(name);
        }

        let Some(outcome) = outcome else { return };
        for member in &outcome.remaining_members {
            self.router.notify(
                member,
                widget_id,
                json!({"type": "memberLeft", "channel": name, "widgetId": widget_id}),
            );
        }
        if outcome.deleted {
            self.emit(LifecycleEvent::ChannelDeleted {
                name: name.to_string(),
            });
        }
    }

    pub(crate) fn list_channels(&self) -> Vec<ChannelInfo> {
        lock_unpoisoned(&self.channels).list()
    }

    /// Counters plus live registry sizes
    pub(crate) fn metrics(&self) -> BrokerMetrics {
        let mut snapshot = self.metrics.snapshot();
        snapshot.registered_widgets = lock_unpoisoned(&self.registry).len();
        snapshot.channels = lock_unpoisoned(&self.channels).len();
        snapshot.pending_requests = self.requests.pending_count();
        snapshot.sync_groups = self.sync.group_count();
        snapshot
    }

    /// Full unregistration cascade
    pub(crate) fn unregister(&self, widget_id: &str) {
        let removed = lock_unpoisoned(&self.registry).unregister(widget_id);
        let Some(widget) = removed else { return };

        // Subscriptions died with the record; now leave every channel
        for name in &widget.channels {
            self.leave_channel(widget_id, name);
        }
        self.state.remove_widget(widget_id);
        self.sync.remove_widget(widget_id);

        debug!(widget_id = %widget_id, "Widget unregistered");
        self.emit(LifecycleEvent::WidgetUnregistered {
            widget_id: widget_id.to_string(),
        });
    }
}

/// The widget communication broker
///
/// Cheap to clone; all clones share one instance. Widgets interact through
/// the [`WidgetHandle`] returned by [`Broker::register`]; the hosting
/// application uses the broker itself for lifecycle observation and teardown.
#[derive(Clone)]
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Broker {
    /// Create a broker with the given configuration
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(Mutex::new(WidgetRegistry::new()));
        let channels = Arc::new(Mutex::new(ChannelManager::new(config.history_capacity())));
        let metrics = Arc::new(MetricsCollector::new());
        let router = Arc::new(Router::new(
            registry.clone(),
            channels.clone(),
            metrics.clone(),
            config.max_message_size,
            config.enable_logging,
        ));
        let requests = Arc::new(RequestCoordinator::new(
            router.clone(),
            metrics.clone(),
            config.message_timeout(),
        ));
        let state = Arc::new(SharedState::new(metrics.clone()));
        let sync = Arc::new(SyncGroupManager::new(router.clone()));
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        info!(
            max_message_size = config.max_message_size,
            message_timeout_ms = config.message_timeout_ms,
            "Broker created"
        );

        Self {
            core: Arc::new(BrokerCore {
                registry,
                channels,
                router,
                requests,
                state,
                sync,
                metrics,
                lifecycle,
            }),
        }
    }

    /// Register a widget and hand back its capability facade; never fails
    pub fn register(&self, descriptor: WidgetDescriptor) -> WidgetHandle {
        let widget_type = descriptor.widget_type.clone();
        let title = descriptor.title.clone();
        let widget_id = lock_unpoisoned(&self.core.registry).register(descriptor);

        self.core.emit(LifecycleEvent::WidgetRegistered {
            widget_id: widget_id.clone(),
            widget_type,
            title,
        });
        WidgetHandle::new(self.core.clone(), widget_id)
    }

    /// Unregister a widget by id; idempotent
    pub fn unregister(&self, widget_id: &str) {
        self.core.unregister(widget_id);
    }

    /// Whether a widget id is currently registered
    pub fn is_registered(&self, widget_id: &str) -> bool {
        lock_unpoisoned(&self.core.registry).exists(widget_id)
    }

    /// Subscribe to lifecycle events (registered/unregistered/channel
    /// created/deleted)
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.core.lifecycle.subscribe()
    }

    /// Current broker metrics
    pub fn metrics(&self) -> BrokerMetrics {
        self.core.metrics()
    }

    /// Diagnostic send log; empty unless `enable_logging` is set
    pub fn send_log(&self) -> Vec<SendRecord> {
        self.core.router.send_log()
    }

    /// Tear the broker down: unregister every widget, clear channels, shared
    /// state and sync groups, and reject (never drop) pending requests
    pub fn dispose(&self) {
        info!("Broker disposing");
        let widget_ids = lock_unpoisoned(&self.core.registry).ids();
        for widget_id in widget_ids {
            self.core.unregister(&widget_id);
        }
        lock_unpoisoned(&self.core.channels).clear();
        self.core.state.clear();
        self.core.sync.clear();
        self.core.requests.dispose();
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
