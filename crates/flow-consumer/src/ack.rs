//! Acknowledgment tracker.
//!
//! The broker removes a message from its queue when the acknowledgment
//! arrives, so the acknowledgment for a message is only issued once all of
//! its processing side effects are complete. Anything done before that point
//! may be repeated after a crash: delivery is at-least-once and this tracker
//! does not deduplicate.

use crate::message::InboundMessage;
use crate::stats::ConsumerStats;
use std::sync::Arc;
use tracing::{trace, warn};

/// Result of asking the tracker to acknowledge a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Acknowledgment handed to the transport
    Acknowledged,
    /// Message carries no receipt (auto-acknowledged flow or direct delivery)
    NotRequired,
    /// Transport refused the acknowledgment; the broker will redeliver
    Failed,
}

/// Issues acknowledgments once processing has completed
pub struct AcknowledgmentTracker {
    stats: Arc<ConsumerStats>,
}

impl AcknowledgmentTracker {
    pub fn new(stats: Arc<ConsumerStats>) -> Self {
        Self { stats }
    }

    /// Acknowledge a message whose processing is complete.
    ///
    /// Call exactly once per received message, strictly after every side
    /// effect of processing it. Returns without waiting for the broker.
    pub fn on_message_processed(&self, message: &InboundMessage) -> AckOutcome {
        let Some(receipt) = message.receipt.as_ref() else {
            return AckOutcome::NotRequired;
        };

        match receipt.acknowledge() {
            Ok(()) => {
                self.stats.record_acknowledged();
                trace!(
                    message_id = %message.message_id,
                    delivery_tag = receipt.delivery_tag(),
                    "Acknowledgment sent"
                );
                AckOutcome::Acknowledged
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    flow_id = %receipt.flow_id(),
                    error = %e,
                    "Acknowledgment could not be sent; message will be redelivered"
                );
                AckOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
#[path = "ack_tests.rs"]
mod tests;
