//! Error taxonomy for broker operations
//!
//! Routing and validation errors are returned synchronously to the caller.
//! Handler-side failures never surface here; they are caught at the delivery
//! boundary and counted (see `router`).

use std::time::Duration;

use thiserror::Error;

/// Errors from broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    // === Channel errors ===
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel already exists: {0}")]
    ChannelExists(String),

    #[error("Access denied to private channel: {0}")]
    ChannelAccessDenied(String),

    #[error("Channel {name} is full ({max_members} members max)")]
    ChannelFull { name: String, max_members: usize },

    #[error("Widget {widget_id} is not a member of channel {name}")]
    NotAMember { widget_id: String, name: String },

    // === Message errors ===
    #[error("Unknown target widget: {0}")]
    UnknownWidget(String),

    #[error("Payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("No pending request: {0}")]
    NoPendingRequest(String),

    // === Widget errors ===
    #[error("Widget not registered: {0}")]
    WidgetNotRegistered(String),

    // === Timeout errors ===
    #[error("Request {request_id} timed out after {timeout:?}")]
    RequestTimeout { request_id: String, timeout: Duration },

    // === Sync errors ===
    #[error("Sync group not found: {0}")]
    SyncGroupNotFound(String),

    #[error("Sync group already exists: {0}")]
    SyncGroupExists(String),

    #[error("Widget {widget_id} is not a member of sync group {group_id}")]
    NotASyncGroupMember { widget_id: String, group_id: String },

    // === Other ===
    #[error("Invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("Broker disposed")]
    Disposed,
}

impl From<regex::Error> for BrokerError {
    fn from(e: regex::Error) -> Self {
        BrokerError::InvalidPattern(e.to_string())
    }
}

/// Result alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::ChannelFull {
            name: "metrics".to_string(),
            max_members: 4,
        };
        assert_eq!(err.to_string(), "Channel metrics is full (4 members max)");

        let err = BrokerError::PayloadTooLarge { size: 2048, limit: 1024 };
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_regex_error_conversion() {
        let bad = regex::Regex::new("[unclosed");
        let err: BrokerError = bad.unwrap_err().into();
        assert!(matches!(err, BrokerError::InvalidPattern(_)));
    }
}
