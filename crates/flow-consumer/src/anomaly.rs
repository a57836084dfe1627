//! Delivery anomaly detection.
//!
//! Two anomalies are tracked, each as a sticky flag in [`ConsumerStats`]:
//!
//! - **Redelivery**: the broker already delivered this message once and never
//!   received an acknowledgment for it. The message was delivered more than
//!   once.
//! - **Discard**: on direct (non-guaranteed) delivery, the broker dropped
//!   messages for this consumer before this one because its egress buffer
//!   overflowed. Those messages were never delivered at all.
//!
//! Detection runs inline in the receive callback and never logs per message;
//! the monitoring loop reports and clears each flag at most once per interval.

use crate::message::InboundMessage;
use crate::stats::ConsumerStats;
use std::sync::Arc;
use tracing::trace;

/// Result of inspecting one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inspection {
    pub is_redelivered: bool,
}

/// Raises anomaly flags for inbound messages
pub struct DeliveryAnomalyDetector {
    stats: Arc<ConsumerStats>,
}

impl DeliveryAnomalyDetector {
    pub fn new(stats: Arc<ConsumerStats>) -> Self {
        Self { stats }
    }

    /// Check the redelivery flag and raise the redelivery anomaly if set
    pub fn inspect(&self, message: &InboundMessage) -> Inspection {
        if message.redelivered && self.stats.redelivery().raise() {
            trace!(
                message_id = %message.message_id,
                delivery_count = message.delivery_count,
                "Redelivery anomaly raised"
            );
        }

        Inspection {
            is_redelivered: message.redelivered,
        }
    }

    /// Check the discard indication and raise the discard anomaly if set
    pub fn has_discard_indication(&self, message: &InboundMessage) -> bool {
        if message.discard_indication && self.stats.discard().raise() {
            trace!(message_id = %message.message_id, "Discard anomaly raised");
        }

        message.discard_indication
    }
}

#[cfg(test)]
#[path = "anomaly_tests.rs"]
mod tests;
