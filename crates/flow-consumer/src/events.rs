//! Session and flow event notifications.
//!
//! Events describe the health of the underlying transport and of individual
//! flows. They are informational: no pipeline state changes because of an
//! event. Fatal transport loss is reported separately through
//! [`MessageListener::on_exception`](crate::session::MessageListener::on_exception).

use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

// ============================================================================
// Event Types
// ============================================================================

/// Notification about the session transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    /// Connection dropped; the transport is retrying
    Reconnecting { attempt: u32 },
    /// Connection restored after a reconnect
    Reconnected,
    /// Connection lost with no further retries
    DownError { message: String },
    /// Broker rejected a subscription after it was applied
    SubscriptionError { subscription: String, reason: String },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            Self::Reconnected => write!(f, "reconnected"),
            Self::DownError { message } => write!(f, "down: {}", message),
            Self::SubscriptionError {
                subscription,
                reason,
            } => write!(f, "subscription '{}' error: {}", subscription, reason),
        }
    }
}

/// Notification about a single flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FlowEvent {
    /// Flow became the active consumer of its queue
    Active,
    /// Another consumer took over the queue
    Inactive,
    /// Flow unbound while the transport reconnects
    Reconnecting,
    /// Flow rebound after a reconnect
    Reconnected,
    /// Flow closed by the broker
    DownError { message: String },
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Reconnected => write!(f, "reconnected"),
            Self::DownError { message } => write!(f, "down: {}", message),
        }
    }
}

// ============================================================================
// Handler Traits
// ============================================================================

/// Receives session events on a broker-owned task. Must not block.
pub trait SessionEventHandler: Send + Sync {
    fn on_session_event(&self, event: SessionEvent);
}

/// Receives flow events on a broker-owned task. Must not block.
pub trait FlowEventHandler: Send + Sync {
    fn on_flow_event(&self, flow_id: &str, event: FlowEvent);
}

/// Handler that writes every event to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

impl SessionEventHandler for LoggingEventHandler {
    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::DownError { .. } | SessionEvent::SubscriptionError { .. } => {
                warn!(event = %event, "Received a session event");
            }
            _ => info!(event = %event, "Received a session event"),
        }
    }
}

impl FlowEventHandler for LoggingEventHandler {
    fn on_flow_event(&self, flow_id: &str, event: FlowEvent) {
        info!(flow_id = %flow_id, event = %event, "Received a flow event");
    }
}

// ============================================================================
// Session Event Channel
// ============================================================================

/// Handler that forwards session events into an unbounded channel so a
/// controlling task can consume them as a stream.
///
/// Sending never blocks the broker task. Events raised after the receiver is
/// dropped are discarded.
#[derive(Debug, Clone)]
pub struct SessionEventChannel {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEventChannel {
    /// Create the channel and its receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SessionEventHandler for SessionEventChannel {
    fn on_session_event(&self, event: SessionEvent) {
        info!(event = %event, "Received a session event");
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
