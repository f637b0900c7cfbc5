//! Message envelope, targets, and lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a message is headed
///
/// Rendered to / parsed from the string forms `<widget-id>`,
/// `channel:<name>` and `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Target {
    /// A single registered widget
    Direct(String),
    /// Every current member of a named channel (except the sender)
    Channel(String),
    /// Every registered widget (except the sender)
    Broadcast,
}

impl Target {
    /// Parse a target descriptor string
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Target::Broadcast
        } else if let Some(name) = s.strip_prefix("channel:") {
            Target::Channel(name.to_string())
        } else {
            Target::Direct(s.to_string())
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Direct(id) => write!(f, "{id}"),
            Target::Channel(name) => write!(f, "channel:{name}"),
            Target::Broadcast => write!(f, "*"),
        }
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        t.to_string()
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        Target::parse(&s)
    }
}

/// The unit of transport between widgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message id
    pub id: String,
    /// Sender widget id
    pub from: String,
    /// Target descriptor
    pub to: Target,
    /// Payload; by convention an object with a `type` field
    pub message: serde_json::Value,
    /// Time the envelope was accepted for routing
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Build a new envelope with a fresh id and timestamp
    pub fn new(from: impl Into<String>, to: Target, message: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            from: from.into(),
            to,
            message,
            timestamp: Utc::now(),
        }
    }

    /// The payload's `type` field, when the payload is an object carrying one
    pub fn message_type(&self) -> Option<&str> {
        self.message.get("type").and_then(|v| v.as_str())
    }
}

/// Lifecycle events observable by the hosting application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// A widget joined the broker
    WidgetRegistered {
        widget_id: String,
        widget_type: Option<String>,
        title: Option<String>,
    },
    /// A widget left the broker (explicitly or via dispose)
    WidgetUnregistered { widget_id: String },
    /// A channel was created
    ChannelCreated { name: String, created_by: String },
    /// A channel was deleted (last member left a non-persistent channel)
    ChannelDeleted { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_parse_roundtrip() {
        assert_eq!(Target::parse("*"), Target::Broadcast);
        assert_eq!(Target::parse("channel:c1"), Target::Channel("c1".to_string()));
        assert_eq!(Target::parse("widget-7"), Target::Direct("widget-7".to_string()));

        assert_eq!(Target::Channel("c1".to_string()).to_string(), "channel:c1");
        assert_eq!(Target::Broadcast.to_string(), "*");
    }

    #[test]
    fn test_target_serde_as_string() {
        let json = serde_json::to_string(&Target::Channel("c1".to_string())).unwrap();
        assert_eq!(json, "\"channel:c1\"");

        let back: Target = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(back, Target::Broadcast);
    }

    #[test]
    fn test_envelope_message_type() {
        let env = MessageEnvelope::new("a", Target::Broadcast, json!({"type": "ping"}));
        assert_eq!(env.message_type(), Some("ping"));

        let env = MessageEnvelope::new("a", Target::Broadcast, json!(42));
        assert_eq!(env.message_type(), None);
    }

    #[test]
    fn test_lifecycle_event_tagged_serialization() {
        let event = LifecycleEvent::ChannelCreated {
            name: "c1".to_string(),
            created_by: "w1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ChannelCreated\""));
    }
}
