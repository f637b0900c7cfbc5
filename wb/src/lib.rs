//! WidgetBroker - in-process communication for dashboard widgets
//!
//! Independently developed widgets hosted in one dashboard page discover each
//! other, exchange messages, coordinate through request/response calls, and
//! share mutable state without holding direct references to one another.
//!
//! # Core Concepts
//!
//! - **Capability handles**: registration returns a [`WidgetHandle`] scoped
//!   to one widget id; a widget can never act as another widget
//! - **Synchronous delivery**: sends complete (or fail) within the caller's
//!   turn; the only suspension point is [`WidgetHandle::request`]
//! - **Failure isolation**: a subscriber handler error is counted and logged,
//!   never propagated to the sender or to other subscribers
//! - **Explicit ownership**: every registry belongs to one [`Broker`]
//!   instance; independent brokers coexist freely in one process
//!
//! # Modules
//!
//! - [`broker`] - the facade and per-widget handles
//! - [`channel`] - named many-to-many groups with membership and history
//! - [`router`] - target resolution and subscription delivery
//! - [`request`] - correlated request/response with timeouts
//! - [`state`] - shared key/value space with change notification
//! - [`sync`] - versioned multi-widget data replication
//! - [`config`] - configuration types

pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pattern;
pub mod registry;
pub mod request;
pub mod router;
pub mod state;
pub mod sync;

// Re-export commonly used types
pub use broker::{Broker, LocalHandler, WidgetHandle};
pub use channel::{Channel, ChannelInfo, ChannelManager, ChannelOptions};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use message::{LifecycleEvent, MessageEnvelope, Target};
pub use metrics::{BrokerMetrics, MetricsCollector};
pub use pattern::Pattern;
pub use registry::{MessageHandler, Subscription, Widget, WidgetDescriptor, WidgetRegistry};
pub use request::RequestCoordinator;
pub use router::{Router, SendRecord};
pub use state::{SharedState, StateChange, StateChangeKind, StateHandler};
pub use sync::{ConflictPolicy, SyncEntry, SyncGroupManager};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering from poisoning
///
/// No lock is ever held across a subscriber handler call, so a poisoned
/// guard can only come from a panic in broker-internal bookkeeping; the
/// protected state is still coherent and the lock is safe to re-take.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
