//! Broker session seam and callback surfaces.
//!
//! A broker client implements [`Session`], [`Flow`] and [`DirectConsumer`];
//! the pipelines in this crate implement [`MessageListener`]. Connecting,
//! authenticating and reconnecting are the broker client's business: by the
//! time a `Session` reaches this crate it is already connected.

use crate::error::{ConsumerError, FlowBindError, SessionError};
use crate::events::FlowEventHandler;
use crate::flow::FlowConfig;
use crate::message::{InboundMessage, QueueName, TopicSubscription};
use async_trait::async_trait;
use std::sync::Arc;

// ============================================================================
// Callback Surfaces
// ============================================================================

/// Receives messages and transport exceptions from the broker client.
///
/// Both methods run on a broker-owned task that may serve every flow of the
/// session, so they must return promptly and must not panic.
pub trait MessageListener: Send + Sync {
    /// Handle one delivered message
    fn on_receive(&self, message: InboundMessage);

    /// Handle an exception raised by the transport or the flow
    fn on_exception(&self, error: ConsumerError);
}

/// [`MessageListener`] assembled from two closures
pub struct FnMessageListener<R, E> {
    on_receive: R,
    on_exception: E,
}

impl<R, E> FnMessageListener<R, E>
where
    R: Fn(InboundMessage) + Send + Sync,
    E: Fn(ConsumerError) + Send + Sync,
{
    pub fn new(on_receive: R, on_exception: E) -> Self {
        Self {
            on_receive,
            on_exception,
        }
    }
}

impl<R, E> MessageListener for FnMessageListener<R, E>
where
    R: Fn(InboundMessage) + Send + Sync,
    E: Fn(ConsumerError) + Send + Sync,
{
    fn on_receive(&self, message: InboundMessage) {
        (self.on_receive)(message)
    }

    fn on_exception(&self, error: ConsumerError) {
        (self.on_exception)(error)
    }
}

// ============================================================================
// Broker Seam
// ============================================================================

/// Connected session to a broker
#[async_trait]
pub trait Session: Send + Sync {
    /// Bind a flow to a durable queue.
    ///
    /// The flow delivers nothing until [`Flow::start`] is called.
    async fn create_flow(
        &self,
        config: &FlowConfig,
        listener: Arc<dyn MessageListener>,
        events: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, FlowBindError>;

    /// Create the session's consumer for direct (non-guaranteed) messages
    async fn create_consumer(
        &self,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn DirectConsumer>, SessionError>;

    /// Attract direct messages published to matching topics
    async fn add_subscription(&self, subscription: &TopicSubscription)
        -> Result<(), SessionError>;

    /// Stop attracting direct messages for a subscription
    async fn remove_subscription(
        &self,
        subscription: &TopicSubscription,
    ) -> Result<(), SessionError>;

    /// Close the session and every flow and consumer bound to it
    async fn close(&self) -> Result<(), SessionError>;

    /// Check if the session has been closed
    fn is_closed(&self) -> bool;
}

/// Receiving binding between a session and one queue
#[async_trait]
pub trait Flow: Send + Sync {
    /// Broker-assigned flow identifier
    fn flow_id(&self) -> &str;

    /// Queue the flow is bound to
    fn queue(&self) -> &QueueName;

    /// Begin delivering messages to the listener
    async fn start(&self) -> Result<(), SessionError>;

    /// Stop delivery. Messages already delivered can still be acknowledged
    /// until the session closes; unacknowledged messages stay on the broker.
    async fn stop(&self) -> Result<(), SessionError>;
}

/// Consumer of direct messages attracted by session subscriptions
#[async_trait]
pub trait DirectConsumer: Send + Sync {
    /// Begin delivering messages to the listener
    async fn start(&self) -> Result<(), SessionError>;

    /// Stop delivery and release the consumer
    async fn close(&self) -> Result<(), SessionError>;
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
