//! Common test utilities for flow-consumer integration tests
//!
//! This module provides:
//! - Broker and session setup against the in-memory broker
//! - Message processors with scripted outcomes
//! - Polling helpers for asynchronous delivery

use flow_consumer::{
    BrokerCall, ConsumerStats, InMemoryBroker, InMemorySession, InboundMessage, LoggingEventHandler,
    MessageProcessor, ProcessingError, QueueName, QueueSpec, SessionProperties, TopicSubscription,
};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// Queue the guaranteed samples bind to
#[allow(dead_code)]
pub const QUEUE: &str = "q_pers_sub";

#[allow(dead_code)]
pub fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

#[allow(dead_code)]
pub fn subscription(pattern: &str) -> TopicSubscription {
    TopicSubscription::new(pattern.to_string()).unwrap()
}

pub fn properties() -> SessionProperties {
    SessionProperties {
        host: "localhost:55555".to_string(),
        vpn: "default".to_string(),
        username: "integration".to_string(),
        ..SessionProperties::default()
    }
}

/// Broker with the sample queue provisioned and attracting `samples/pers/>`
#[allow(dead_code)]
pub fn provisioned_broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.provision_queue(
        QueueSpec::new(queue_name(QUEUE)).with_subscription(subscription("samples/pers/>")),
    );
    broker
}

pub async fn connect(broker: &InMemoryBroker) -> InMemorySession {
    broker
        .connect(&properties(), Arc::new(LoggingEventHandler))
        .await
        .unwrap()
}

/// Poll until `stats` has counted at least `count` deliveries
#[allow(dead_code)]
pub async fn wait_for_received(stats: &ConsumerStats, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.total_received() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {} deliveries, saw {}",
            count,
            stats.total_received()
        )
    });
}

/// Number of journal entries matching `predicate`
#[allow(dead_code)]
pub fn count_calls(broker: &InMemoryBroker, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
    broker.journal().iter().filter(|c| predicate(c)).count()
}

/// Position of the first journal entry matching `predicate`
#[allow(dead_code)]
pub fn position_of(broker: &InMemoryBroker, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
    broker
        .journal()
        .iter()
        .position(|c| predicate(c))
        .unwrap_or_else(|| panic!("call not found in journal: {:?}", broker.journal()))
}

// ============================================================================
// Scripted Processors
// ============================================================================

/// Processor that rejects the first delivery attempt of every message and
/// accepts redeliveries
#[derive(Default)]
#[allow(dead_code)]
pub struct RejectFirstAttempt {
    seen: Mutex<Vec<String>>,
}

impl RejectFirstAttempt {
    #[allow(dead_code)]
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessageProcessor for RejectFirstAttempt {
    fn process(&self, message: &InboundMessage) -> Result<(), ProcessingError> {
        self.seen
            .lock()
            .unwrap()
            .push(message.message_id.to_string());
        if message.redelivered {
            Ok(())
        } else {
            Err(ProcessingError::Rejected {
                message_id: message.message_id.to_string(),
                reason: "first attempt".to_string(),
            })
        }
    }
}
