//! Error types for flow consumption.
//!
//! Only session-wide transport failures are fatal to a running pipeline; every
//! other error in this module is local to one message, one binding attempt or
//! one configuration source.

use crate::message::QueueName;
use thiserror::Error;

/// Classified error delivered to a [`MessageListener`](crate::session::MessageListener)
/// through its exception callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumerError {
    #[error("Transport lost after exhausting reconnect attempts: {message}")]
    TransportFatal { message: String },

    #[error("Transient transport error: {message}")]
    Transient { message: String },

    #[error("Malformed message {message_id}: {reason}")]
    MalformedMessage { message_id: String, reason: String },
}

impl ConsumerError {
    /// Check if the error ends the session and must shut the pipeline down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportFatal { .. })
    }

    /// Check if the transport is expected to recover on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure to bind a flow to a durable queue
#[derive(Debug, Error)]
pub enum FlowBindError {
    #[error("Queue '{queue}' does not exist or is not accessible: {reason}")]
    QueueMissingOrUnauthorized { queue: QueueName, reason: String },

    #[error("Operation not supported by the broker: {operation}")]
    UnsupportedOperation { operation: String },

    #[error("Session error while binding: {0}")]
    Session(#[from] SessionError),
}

impl FlowBindError {
    /// Operator guidance for resolving the binding failure.
    ///
    /// Only a missing or unauthorized queue can be fixed by the operator, so
    /// every other variant returns `None`.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::QueueMissingOrUnauthorized { queue, .. } => Some(format!(
                "Could not bind to queue '{queue}'. Create the queue on the broker \
                 (management console or provisioning scripts), grant this client \
                 consume permission, and add a topic subscription for the messages \
                 it should attract. Provision the queue before starting the consumer."
            )),
            Self::UnsupportedOperation { .. } | Self::Session(_) => None,
        }
    }

    /// Check if the failure is a startup failure that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }
}

/// Errors from session-level broker operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Session has been closed")]
    Closed,

    #[error("Connection to '{host}' refused: {reason}")]
    ConnectionRefused { host: String, reason: String },

    #[error("Subscription '{subscription}' rejected: {reason}")]
    SubscriptionRejected {
        subscription: String,
        reason: String,
    },

    #[error("Broker operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },
}

/// Errors raised when handing an acknowledgment to the transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("Flow '{flow_id}' is no longer bound")]
    FlowUnbound { flow_id: String },

    #[error("Delivery {delivery_tag} on flow '{flow_id}' is not awaiting acknowledgment")]
    UnknownDelivery { flow_id: String, delivery_tag: u64 },
}

/// Application-level failure while processing one message.
///
/// A message whose processing fails is left unacknowledged so the broker
/// redelivers it later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("Message {message_id} rejected: {reason}")]
    Rejected { message_id: String, reason: String },

    #[error("Downstream failure: {message}")]
    Downstream { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
