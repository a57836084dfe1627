//! Message types for flow consumption including core domain identifiers.

use crate::error::{AckError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated name of a durable queue on the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 200 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-200 characters".to_string(),
            });
        }

        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "whitespace and control characters are not allowed".to_string(),
            });
        }

        // Wildcards belong to topic subscriptions, never to endpoint names
        if name.contains('*') || name.contains('>') {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "wildcard characters '*' and '>' are not allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages within the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Destinations and Subscriptions
// ============================================================================

/// Where a message was published to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Hierarchical topic, levels separated by `/`
    Topic(String),
    /// Durable queue addressed directly
    Queue(QueueName),
}

impl Destination {
    /// Create a topic destination
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    /// Get destination name
    pub fn name(&self) -> &str {
        match self {
            Self::Topic(name) => name,
            Self::Queue(queue) => queue.as_str(),
        }
    }

    /// Check if the destination name ends with a reserved control suffix
    pub fn has_suffix(&self, suffix: &str) -> bool {
        !suffix.is_empty() && self.name().ends_with(suffix)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(name) => write!(f, "topic '{}'", name),
            Self::Queue(queue) => write!(f, "queue '{}'", queue),
        }
    }
}

/// Validated topic subscription.
///
/// Levels are separated by `/`. A level of `*` matches exactly one level, a
/// level ending in `*` (for example `ord*`) matches any level with that
/// prefix, and a final level of `>` matches one or more remaining levels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSubscription(String);

impl TopicSubscription {
    /// Create new subscription with validation
    pub fn new(pattern: String) -> Result<Self, ValidationError> {
        if pattern.is_empty() || pattern.len() > 250 {
            return Err(ValidationError::OutOfRange {
                field: "subscription".to_string(),
                message: "must be 1-250 characters".to_string(),
            });
        }

        let levels: Vec<&str> = pattern.split('/').collect();
        let last = levels.len() - 1;
        for (index, level) in levels.iter().enumerate() {
            if level.is_empty() {
                return Err(ValidationError::InvalidFormat {
                    field: "subscription".to_string(),
                    message: "empty topic levels are not allowed".to_string(),
                });
            }

            if level.contains('>') && (*level != ">" || index != last) {
                return Err(ValidationError::InvalidFormat {
                    field: "subscription".to_string(),
                    message: "'>' must be the entire final level".to_string(),
                });
            }

            if (level.contains('*') && !level.ends_with('*')) || level.matches('*').count() > 1 {
                return Err(ValidationError::InvalidFormat {
                    field: "subscription".to_string(),
                    message: "'*' may only appear once, at the end of a level".to_string(),
                });
            }
        }

        Ok(Self(pattern))
    }

    /// Get subscription pattern as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if a concrete topic matches this subscription
    pub fn matches(&self, topic: &str) -> bool {
        let mut pattern_levels = self.0.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (pattern_levels.next(), topic_levels.next()) {
                (Some(">"), Some(level)) => return !level.is_empty(),
                (Some(pattern), Some(level)) => {
                    let matched = match pattern.strip_suffix('*') {
                        Some(prefix) => level.starts_with(prefix) && !level.is_empty(),
                        None => pattern == level,
                    };
                    if !matched {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicSubscription {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

// ============================================================================
// Acknowledgment Handles
// ============================================================================

/// Transport-side sink for acknowledgments.
///
/// Implementations must hand the acknowledgment to the transport without
/// waiting for broker confirmation.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge one delivery on the flow that produced it
    fn acknowledge(&self, delivery_tag: u64) -> Result<(), AckError>;
}

/// Handle retained to acknowledge a delivered message.
///
/// The handle is cheap to clone and may be moved to another thread so the
/// acknowledgment can be issued wherever processing completes.
#[derive(Clone)]
pub struct ReceiptHandle {
    flow_id: String,
    delivery_tag: u64,
    acknowledger: Arc<dyn Acknowledger>,
}

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(flow_id: String, delivery_tag: u64, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            flow_id,
            delivery_tag,
            acknowledger,
        }
    }

    /// Get the flow the delivery belongs to
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Get the per-flow delivery tag
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Send the acknowledgment for this delivery
    pub fn acknowledge(&self) -> Result<(), AckError> {
        self.acknowledger.acknowledge(self.delivery_tag)
    }
}

impl fmt::Debug for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptHandle")
            .field("flow_id", &self.flow_id)
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Inbound Messages
// ============================================================================

/// A message delivered to a consumer, once per broker-side delivery attempt
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub destination: Destination,
    pub payload: Bytes,
    /// Broker already attempted delivery of this message without an acknowledgment
    pub redelivered: bool,
    /// Broker discarded messages for this consumer before this one
    pub discard_indication: bool,
    pub delivery_count: u32,
    pub received_at: Timestamp,
    /// Present only on flows with client acknowledgment
    pub receipt: Option<ReceiptHandle>,
}

impl InboundMessage {
    /// Create a first-delivery message with no receipt
    pub fn new(destination: Destination, payload: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            destination,
            payload,
            redelivered: false,
            discard_indication: false,
            delivery_count: 1,
            received_at: Timestamp::now(),
            receipt: None,
        }
    }

    /// Set message ID
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Mark message as redelivered
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Mark that earlier messages for this consumer were discarded
    pub fn with_discard_indication(mut self, discard_indication: bool) -> Self {
        self.discard_indication = discard_indication;
        self
    }

    /// Set broker-side delivery count
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Attach the receipt used for acknowledgment
    pub fn with_receipt(mut self, receipt: ReceiptHandle) -> Self {
        self.receipt = Some(receipt);
        self
    }

    /// Check if the message must be acknowledged by the client
    pub fn requires_ack(&self) -> bool {
        self.receipt.is_some()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
