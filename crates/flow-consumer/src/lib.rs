//! # Flow Consumer
//!
//! Guaranteed-delivery message consumption with explicit acknowledgment,
//! delivery anomaly detection and graceful shutdown.
//!
//! This library provides:
//! - Binding of durable queues to receiving flows with client acknowledgment
//! - Acknowledgment strictly after application processing completes
//! - Redelivery and discard detection reported once per monitoring interval
//! - A single shutdown gate driving a `Running -> Draining -> Closed` lifecycle
//! - Direct topic subscriptions sharing the same monitoring and shutdown
//! - An in-memory broker implementing the session seam
//!
//! ## Module Organization
//!
//! - [`session`] - Broker seam traits and message callbacks
//! - [`events`] - Session and flow event notifications
//! - [`flow`] - Flow controller and bound flows
//! - [`ack`] - Acknowledgment tracker
//! - [`anomaly`] - Delivery anomaly detector
//! - [`shutdown`] - Shutdown coordinator
//! - [`monitor`] - Monitoring loop and interval observers
//! - [`processor`] - Guaranteed-delivery pipeline
//! - [`subscriber`] - Direct subscription pipeline
//! - [`config`] - Layered configuration
//! - [`providers`] - Broker implementations

pub mod ack;
pub mod anomaly;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod message;
pub mod monitor;
pub mod processor;
pub mod providers;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod subscriber;

#[cfg(test)]
mod test_support;

pub use ack::{AckOutcome, AcknowledgmentTracker};
pub use anomaly::{DeliveryAnomalyDetector, Inspection};
pub use config::{ConsumerConfig, SessionProperties};
pub use error::{
    AckError, ConfigurationError, ConsumerError, FlowBindError, ProcessingError, SessionError,
    ValidationError,
};
pub use events::{
    FlowEvent, FlowEventHandler, LoggingEventHandler, SessionEvent, SessionEventChannel,
    SessionEventHandler,
};
pub use flow::{AckMode, BoundFlow, FlowConfig, FlowController};
pub use message::{
    Acknowledger, Destination, InboundMessage, MessageId, QueueName, ReceiptHandle, Timestamp,
    TopicSubscription,
};
pub use monitor::{
    ChannelObserver, IntervalObserver, IntervalRecord, LoggingObserver, MonitorExit,
    MonitorSummary, MonitoringLoop, RecordingObserver,
};
pub use processor::{
    AcceptAll, GuaranteedProcessor, MessageProcessor, QueueFlowListener, RunSummary,
};
pub use providers::{BrokerCall, InMemoryBroker, InMemorySession, QueueSpec};
pub use session::{DirectConsumer, Flow, FnMessageListener, MessageListener, Session};
pub use shutdown::{Drainable, ShutdownCoordinator, ShutdownReason, ShutdownState};
pub use stats::{ConsumerStats, StatsSnapshot, StickyFlag};
pub use subscriber::{DirectMessageListener, DirectSubscriber};
