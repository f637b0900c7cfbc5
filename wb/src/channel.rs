//! Channel manager
//!
//! Owns channel creation, membership, access control and the bounded
//! per-channel history buffer. Like the registry this is pure bookkeeping;
//! join/leave fan-out and replay delivery happen in the broker, outside the
//! channel lock.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BrokerError;
use crate::message::MessageEnvelope;

/// Channel creation options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Only the creator and allow-listed widgets may join
    #[serde(default)]
    pub private: bool,
    /// Survives its last member leaving
    #[serde(default)]
    pub persistent: bool,
    /// Membership cap; unlimited when absent
    #[serde(default)]
    pub max_members: Option<usize>,
    /// Widgets allowed into a private channel besides the creator
    #[serde(default)]
    pub allowed: Vec<String>,
}

/// A named many-to-many messaging group
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub options: ChannelOptions,
    members: HashSet<String>,
    history: VecDeque<MessageEnvelope>,
}

impl Channel {
    pub fn members(&self) -> &HashSet<String> {
        &self.members
    }
}

/// Result of a successful join
#[derive(Debug)]
pub struct JoinOutcome {
    /// Members present before the join (for memberJoined fan-out)
    pub prior_members: Vec<String>,
    /// Most recent buffered messages, replayed to the joiner only
    pub replay: Vec<MessageEnvelope>,
}

/// Result of a successful leave
#[derive(Debug)]
pub struct LeaveOutcome {
    /// Members remaining after the leave (for memberLeft fan-out)
    pub remaining_members: Vec<String>,
    /// Whether the channel was deleted (empty and non-persistent)
    pub deleted: bool,
}

/// Summary row for channel listings
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub created_by: String,
    pub member_count: usize,
    pub private: bool,
}

/// Owns all channels of one broker instance
#[derive(Debug)]
pub struct ChannelManager {
    channels: HashMap<String, Channel>,
    /// History ring capacity; zero disables buffering
    history_capacity: usize,
}

impl ChannelManager {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            history_capacity,
        }
    }

    /// Create a channel with the creator as its first member
    pub fn create(
        &mut self,
        creator_id: &str,
        name: &str,
        options: ChannelOptions,
    ) -> Result<(), BrokerError> {
        if self.channels.contains_key(name) {
            return Err(BrokerError::ChannelExists(name.to_string()));
        }
        debug!(name = %name, creator_id = %creator_id, "Creating channel");
        self.channels.insert(
            name.to_string(),
            Channel {
                name: name.to_string(),
                created_by: creator_id.to_string(),
                created_at: Utc::now(),
                options,
                members: HashSet::from([creator_id.to_string()]),
                history: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Join a channel, enforcing access control and the membership cap
    pub fn join(&mut self, widget_id: &str, name: &str) -> Result<JoinOutcome, BrokerError> {
        let channel = self
            .channels
            .get_mut(name)
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))?;

        if channel.members.contains(widget_id) {
            // Already a member: no fan-out, no replay
            return Ok(JoinOutcome {
                prior_members: Vec::new(),
                replay: Vec::new(),
            });
        }

        if channel.options.private
            && channel.created_by != widget_id
            && !channel.options.allowed.iter().any(|w| w == widget_id)
        {
            return Err(BrokerError::ChannelAccessDenied(name.to_string()));
        }

        if let Some(max) = channel.options.max_members
            && channel.members.len() >= max
        {
            return Err(BrokerError::ChannelFull {
                name: name.to_string(),
                max_members: max,
            });
        }

        let prior_members: Vec<String> = channel.members.iter().cloned().collect();
        channel.members.insert(widget_id.to_string());
        debug!(widget_id = %widget_id, name = %name, members = channel.members.len(), "Widget joined channel");

        Ok(JoinOutcome {
            prior_members,
            replay: channel.history.iter().cloned().collect(),
        })
    }

    /// Leave a channel; `None` when the widget was not a member
    ///
    /// Deletes the channel when it is now empty and non-persistent.
    pub fn leave(&mut self, widget_id: &str, name: &str) -> Option<LeaveOutcome> {
        let channel = self.channels.get_mut(name)?;
        if !channel.members.remove(widget_id) {
            return None;
        }

        let remaining_members: Vec<String> = channel.members.iter().cloned().collect();
        let deleted = channel.members.is_empty() && !channel.options.persistent;
        if deleted {
            debug!(name = %name, "Deleting empty non-persistent channel");
            self.channels.remove(name);
        }

        Some(LeaveOutcome {
            remaining_members,
            deleted,
        })
    }

    /// Append an envelope to a channel's history ring, evicting the oldest
    pub fn record(&mut self, name: &str, envelope: MessageEnvelope) {
        if self.history_capacity == 0 {
            return;
        }
        if let Some(channel) = self.channels.get_mut(name) {
            if channel.history.len() == self.history_capacity {
                channel.history.pop_front();
            }
            channel.history.push_back(envelope);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn is_member(&self, widget_id: &str, name: &str) -> bool {
        self.channels
            .get(name)
            .is_some_and(|c| c.members.contains(widget_id))
    }

    /// Member ids of a channel, or an error when the channel is missing
    pub fn members(&self, name: &str) -> Result<Vec<String>, BrokerError> {
        self.channels
            .get(name)
            .map(|c| c.members.iter().cloned().collect())
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))
    }

    /// Summary of every channel
    pub fn list(&self) -> Vec<ChannelInfo> {
        self.channels
            .values()
            .map(|c| ChannelInfo {
                name: c.name.clone(),
                created_by: c.created_by.clone(),
                member_count: c.members.len(),
                private: c.options.private,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
