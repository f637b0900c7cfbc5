//! Message router
//!
//! Resolves an envelope's target to a set of widgets and delivers it to each
//! matching subscription. Delivery is synchronous in the caller's turn; the
//! router never holds the registry or channel lock while a handler runs, so
//! handlers may freely call back into the broker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::ChannelManager;
use crate::error::BrokerError;
use crate::lock_unpoisoned;
use crate::message::{MessageEnvelope, Target};
use crate::metrics::MetricsCollector;
use crate::registry::WidgetRegistry;

/// Bound on the diagnostic send log
const SEND_LOG_CAPACITY: usize = 100;

/// One row of the diagnostic send log
#[derive(Debug, Clone, Serialize)]
pub struct SendRecord {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

/// Routes envelopes to matching subscriptions
pub struct Router {
    registry: Arc<Mutex<WidgetRegistry>>,
    channels: Arc<Mutex<ChannelManager>>,
    metrics: Arc<MetricsCollector>,
    max_message_size: usize,
    /// Bounded send history; `None` when logging is disabled
    send_log: Option<Mutex<VecDeque<SendRecord>>>,
}

impl Router {
    pub fn new(
        registry: Arc<Mutex<WidgetRegistry>>,
        channels: Arc<Mutex<ChannelManager>>,
        metrics: Arc<MetricsCollector>,
        max_message_size: usize,
        enable_logging: bool,
    ) -> Self {
        Self {
            registry,
            channels,
            metrics,
            max_message_size,
            send_log: enable_logging.then(|| Mutex::new(VecDeque::new())),
        }
    }

    /// Route a payload from a widget to a target
    ///
    /// Fails synchronously for validation and routing errors only; handler
    /// failures are isolated at the delivery boundary. Returns the message id.
    pub fn send(
        &self,
        from: &str,
        target: Target,
        message: serde_json::Value,
    ) -> Result<String, BrokerError> {
        if !lock_unpoisoned(&self.registry).exists(from) {
            return Err(BrokerError::WidgetNotRegistered(from.to_string()));
        }

        let size = serde_json::to_vec(&message).map(|b| b.len()).unwrap_or(0);
        if size > self.max_message_size {
            return Err(BrokerError::PayloadTooLarge {
                size,
                limit: self.max_message_size,
            });
        }

        let envelope = MessageEnvelope::new(from, target.clone(), message);
        let started = Instant::now();
        self.metrics.record_sent();
        debug!(message_id = %envelope.id, from = %from, to = %target, "Routing message");

        let recipients: Vec<String> = match &target {
            Target::Channel(name) => {
                let mut channels = lock_unpoisoned(&self.channels);
                if channels.get(name).is_none() {
                    return Err(BrokerError::ChannelNotFound(name.clone()));
                }
                if !channels.is_member(from, name) {
                    return Err(BrokerError::NotAMember {
                        widget_id: from.to_string(),
                        name: name.clone(),
                    });
                }
                channels.record(name, envelope.clone());
                channels
                    .members(name)?
                    .into_iter()
                    .filter(|m| m != from)
                    .collect()
            }
            Target::Broadcast => lock_unpoisoned(&self.registry)
                .ids()
                .into_iter()
                .filter(|id| id != from)
                .collect(),
            Target::Direct(id) => {
                if !lock_unpoisoned(&self.registry).exists(id) {
                    return Err(BrokerError::UnknownWidget(id.clone()));
                }
                vec![id.clone()]
            }
        };

        for widget_id in &recipients {
            self.deliver_to(widget_id, &envelope);
        }

        self.log_send(&envelope);
        self.metrics.record_latency(started.elapsed());
        Ok(envelope.id)
    }

    /// Deliver one envelope to one widget's matching subscriptions
    ///
    /// Iterates a snapshot of the subscription set so handlers that
    /// subscribe or unsubscribe mid-delivery cannot corrupt iteration.
    pub(crate) fn deliver_to(&self, widget_id: &str, envelope: &MessageEnvelope) {
        let subscriptions = lock_unpoisoned(&self.registry).subscriptions_snapshot(widget_id);

        for sub in subscriptions {
            if !sub.pattern.matches(envelope) {
                continue;
            }
            match (sub.handler)(envelope) {
                Ok(()) => self.metrics.record_delivered(),
                Err(e) => {
                    self.metrics.record_handler_error();
                    warn!(
                        widget_id = %widget_id,
                        sub_id = %sub.id,
                        message_id = %envelope.id,
                        error = %e,
                        "Subscription handler failed"
                    );
                }
            }
        }
    }

    /// Build and deliver a system notification to one widget
    ///
    /// Used for membership fan-out and sync snapshots; skips target
    /// validation and send metering, which apply to widget sends only.
    pub(crate) fn notify(&self, to: &str, from: &str, message: serde_json::Value) {
        let envelope = MessageEnvelope::new(from, Target::Direct(to.to_string()), message);
        self.deliver_to(to, &envelope);
    }

    fn log_send(&self, envelope: &MessageEnvelope) {
        if let Some(log) = &self.send_log {
            let mut log = lock_unpoisoned(log);
            if log.len() == SEND_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(SendRecord {
                message_id: envelope.id.clone(),
                from: envelope.from.clone(),
                to: envelope.to.to_string(),
                timestamp: envelope.timestamp,
            });
        }
    }

    /// Copy of the diagnostic send log; empty when logging is disabled
    pub fn send_log(&self) -> Vec<SendRecord> {
        self.send_log
            .as_ref()
            .map(|log| lock_unpoisoned(log).iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use crate::registry::WidgetDescriptor;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(max_size: usize, logging: bool) -> (Router, Arc<Mutex<WidgetRegistry>>, Arc<Mutex<ChannelManager>>, Arc<MetricsCollector>) {
        let registry = Arc::new(Mutex::new(WidgetRegistry::new()));
        let channels = Arc::new(Mutex::new(ChannelManager::new(10)));
        let metrics = Arc::new(MetricsCollector::new());
        let router = Router::new(
            registry.clone(),
            channels.clone(),
            metrics.clone(),
            max_size,
            logging,
        );
        (router, registry, channels, metrics)
    }

    fn register(registry: &Mutex<WidgetRegistry>, id: &str) {
        lock_unpoisoned(registry).register(WidgetDescriptor {
            id: Some(id.to_string()),
            ..Default::default()
        });
    }

    fn count_on(
        registry: &Mutex<WidgetRegistry>,
        widget_id: &str,
        pattern: Pattern,
    ) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        lock_unpoisoned(registry)
            .add_subscription(
                widget_id,
                pattern,
                Arc::new(move |_| {
                    captured.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        count
    }

    #[test]
    fn test_direct_send_to_unknown_widget() {
        let (router, registry, _, _) = setup(1024, false);
        register(&registry, "a");
        let err = router
            .send("a", Target::Direct("ghost".to_string()), json!({"type": "x"}))
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownWidget(_)));
    }

    #[test]
    fn test_unregistered_sender_rejected() {
        let (router, registry, _, _) = setup(1024, false);
        register(&registry, "b");
        let err = router
            .send("ghost", Target::Direct("b".to_string()), json!({"type": "x"}))
            .unwrap_err();
        assert!(matches!(err, BrokerError::WidgetNotRegistered(_)));
    }

    #[test]
    fn test_oversized_payload_rejected_before_delivery() {
        let (router, registry, _, metrics) = setup(16, false);
        register(&registry, "a");
        register(&registry, "b");
        let received = count_on(&registry, "b", Pattern::exact("big"));

        let err = router
            .send(
                "a",
                Target::Direct("b".to_string()),
                json!({"type": "big", "blob": "x".repeat(64)}),
            )
            .unwrap_err();
        assert!(matches!(err, BrokerError::PayloadTooLarge { .. }));
        assert_eq!(received.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.snapshot().messages_sent, 0);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let (router, registry, _, _) = setup(1024, false);
        register(&registry, "a");
        register(&registry, "b");
        register(&registry, "c");
        let a_count = count_on(&registry, "a", Pattern::exact("tick"));
        let b_count = count_on(&registry, "b", Pattern::exact("tick"));
        let c_count = count_on(&registry, "c", Pattern::exact("tick"));

        router.send("a", Target::Broadcast, json!({"type": "tick"})).unwrap();

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(c_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_send_requires_membership() {
        let (router, registry, channels, _) = setup(1024, false);
        register(&registry, "a");
        register(&registry, "b");
        lock_unpoisoned(&channels)
            .create("b", "c1", Default::default())
            .unwrap();

        let err = router
            .send("a", Target::Channel("c1".to_string()), json!({"type": "x"}))
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotAMember { .. }));

        let err = router
            .send("a", Target::Channel("nope".to_string()), json!({"type": "x"}))
            .unwrap_err();
        assert!(matches!(err, BrokerError::ChannelNotFound(_)));
    }

    #[test]
    fn test_channel_send_skips_sender_and_records_history() {
        let (router, registry, channels, _) = setup(1024, false);
        register(&registry, "a");
        register(&registry, "b");
        {
            let mut ch = lock_unpoisoned(&channels);
            ch.create("a", "c1", Default::default()).unwrap();
            ch.join("b", "c1").unwrap();
        }
        let a_count = count_on(&registry, "a", Pattern::exact("ping"));
        let b_count = count_on(&registry, "b", Pattern::exact("ping"));

        router
            .send("a", Target::Channel("c1".to_string()), json!({"type": "ping"}))
            .unwrap();

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        // History captured for later replay
        let outcome = lock_unpoisoned(&channels).join("x-new", "c1");
        assert_eq!(outcome.unwrap().replay.len(), 1);
    }

    #[test]
    fn test_handler_isolation() {
        let (router, registry, _, metrics) = setup(1024, false);
        register(&registry, "a");
        register(&registry, "b");

        let first = count_on(&registry, "b", Pattern::exact("boom"));
        lock_unpoisoned(&registry)
            .add_subscription(
                "b",
                Pattern::exact("boom"),
                Arc::new(|_| Err(eyre::eyre!("handler exploded"))),
            )
            .unwrap();
        let third = count_on(&registry, "b", Pattern::exact("boom"));

        // The send itself succeeds despite the failing handler
        router
            .send("a", Target::Direct("b".to_string()), json!({"type": "boom"}))
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().handler_errors, 1);
        assert_eq!(metrics.snapshot().messages_delivered, 2);
    }

    #[test]
    fn test_reentrant_send_from_handler() {
        let (router, registry, _, _) = setup(1024, false);
        let router = Arc::new(router);
        register(&registry, "a");
        register(&registry, "b");
        register(&registry, "c");

        let c_count = count_on(&registry, "c", Pattern::exact("relayed"));

        // b relays every "ping" on to c, synchronously from inside its handler
        let relay = router.clone();
        lock_unpoisoned(&registry)
            .add_subscription(
                "b",
                Pattern::exact("ping"),
                Arc::new(move |_| {
                    relay
                        .send("b", Target::Direct("c".to_string()), json!({"type": "relayed"}))
                        .map(|_| ())
                        .map_err(eyre::Report::from)
                }),
            )
            .unwrap();

        router
            .send("a", Target::Direct("b".to_string()), json!({"type": "ping"}))
            .unwrap();
        assert_eq!(c_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_log_bounded_and_optional() {
        let (router, registry, _, _) = setup(1024, true);
        register(&registry, "a");
        register(&registry, "b");

        for _ in 0..(SEND_LOG_CAPACITY + 20) {
            router
                .send("a", Target::Direct("b".to_string()), json!({"type": "x"}))
                .unwrap();
        }
        assert_eq!(router.send_log().len(), SEND_LOG_CAPACITY);

        let (quiet, registry, _, _) = setup(1024, false);
        register(&registry, "a");
        register(&registry, "b");
        quiet
            .send("a", Target::Direct("b".to_string()), json!({"type": "x"}))
            .unwrap();
        assert!(quiet.send_log().is_empty());
    }

    #[test]
    fn test_metrics_metered_per_send() {
        let (router, registry, _, metrics) = setup(1024, false);
        register(&registry, "a");
        register(&registry, "b");
        count_on(&registry, "b", Pattern::exact("tick"));

        router.send("a", Target::Direct("b".to_string()), json!({"type": "tick"})).unwrap();
        router.send("a", Target::Direct("b".to_string()), json!({"type": "tick"})).unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.messages_delivered, 2);
    }
}
