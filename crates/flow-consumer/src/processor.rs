//! Guaranteed-delivery processing pipeline.
//!
//! [`QueueFlowListener`] runs inline on the broker's delivery task for every
//! message: count it, inspect it for redelivery, hand it to the application
//! [`MessageProcessor`], and acknowledge it only after processing succeeded.
//! [`GuaranteedProcessor`] owns the lifecycle around it: bind, start, monitor
//! until shutdown, drain and close.

use crate::ack::{AckOutcome, AcknowledgmentTracker};
use crate::anomaly::DeliveryAnomalyDetector;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, FlowBindError, ProcessingError, ValidationError};
use crate::events::{FlowEventHandler, LoggingEventHandler};
use crate::flow::{FlowConfig, FlowController};
use crate::message::InboundMessage;
use crate::monitor::{IntervalObserver, MonitorSummary, MonitoringLoop, DEFAULT_INTERVAL};
use crate::session::{MessageListener, Session};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::stats::{ConsumerStats, StatsSnapshot};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

/// Default destination suffix that marks a quit request
pub const DEFAULT_QUIT_SUFFIX: &str = "control/quit";

/// Default wait between stopping delivery and closing the session
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

// ============================================================================
// Message Processor
// ============================================================================

/// Application work performed for each delivered message.
///
/// Runs on the broker's delivery task. Returning `Ok` means every side effect
/// of the message is complete and it may be acknowledged; returning `Err`
/// leaves the message unacknowledged so the broker redelivers it.
pub trait MessageProcessor: Send + Sync {
    fn process(&self, message: &InboundMessage) -> Result<(), ProcessingError>;
}

impl<F> MessageProcessor for F
where
    F: Fn(&InboundMessage) -> Result<(), ProcessingError> + Send + Sync,
{
    fn process(&self, message: &InboundMessage) -> Result<(), ProcessingError> {
        self(message)
    }
}

/// Processor that accepts every message without doing anything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl MessageProcessor for AcceptAll {
    fn process(&self, _message: &InboundMessage) -> Result<(), ProcessingError> {
        Ok(())
    }
}

// ============================================================================
// Queue Flow Listener
// ============================================================================

/// Receive callback of a guaranteed flow
pub struct QueueFlowListener {
    stats: Arc<ConsumerStats>,
    detector: DeliveryAnomalyDetector,
    tracker: AcknowledgmentTracker,
    processor: Arc<dyn MessageProcessor>,
    shutdown: Arc<ShutdownCoordinator>,
    quit_suffix: Option<String>,
}

impl QueueFlowListener {
    pub fn new(
        stats: Arc<ConsumerStats>,
        processor: Arc<dyn MessageProcessor>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            detector: DeliveryAnomalyDetector::new(Arc::clone(&stats)),
            tracker: AcknowledgmentTracker::new(Arc::clone(&stats)),
            stats,
            processor,
            shutdown,
            quit_suffix: None,
        }
    }

    /// Treat messages whose destination ends with `suffix` as quit requests
    pub fn with_quit_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.quit_suffix = Some(suffix.into());
        self
    }

    fn is_quit_message(&self, message: &InboundMessage) -> bool {
        self.quit_suffix
            .as_deref()
            .is_some_and(|suffix| message.destination.has_suffix(suffix))
    }
}

impl MessageListener for QueueFlowListener {
    fn on_receive(&self, message: InboundMessage) {
        self.stats.record_received();
        self.detector.inspect(&message);

        if self.is_quit_message(&message) {
            // Quit requests are consumed so they are not replayed on restart
            self.tracker.on_message_processed(&message);
            self.shutdown.request_shutdown(ShutdownReason::QuitMessage {
                destination: message.destination.name().to_string(),
            });
            return;
        }

        match self.processor.process(&message) {
            Ok(()) => {
                if self.tracker.on_message_processed(&message) == AckOutcome::Failed {
                    debug!(message_id = %message.message_id, "Processed message left unacknowledged");
                }
            }
            Err(e) => {
                self.stats.record_processing_failure();
                warn!(
                    message_id = %message.message_id,
                    destination = %message.destination,
                    error = %e,
                    "Message processing failed; leaving it unacknowledged for redelivery"
                );
            }
        }
    }

    fn on_exception(&self, error: ConsumerError) {
        if error.is_fatal() {
            error!(error = %error, "Transport failure; shutting down");
            self.shutdown.request_shutdown(ShutdownReason::TransportFatal {
                message: error.to_string(),
            });
        } else {
            warn!(error = %error, "Consumer exception");
        }
    }
}

// ============================================================================
// Guaranteed Processor
// ============================================================================

/// Outcome of a completed pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub monitor: MonitorSummary,
    pub reason: Option<ShutdownReason>,
    pub totals: StatsSnapshot,
}

/// Consumes a durable queue with client acknowledgment until shutdown
pub struct GuaranteedProcessor {
    flow_config: FlowConfig,
    interval: Duration,
    grace_period: Duration,
    quit_suffix: Option<String>,
    processor: Arc<dyn MessageProcessor>,
    observers: Vec<Arc<dyn IntervalObserver>>,
    flow_events: Arc<dyn FlowEventHandler>,
    stats: Arc<ConsumerStats>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl GuaranteedProcessor {
    pub fn new(flow_config: FlowConfig) -> Self {
        Self {
            flow_config,
            interval: DEFAULT_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            quit_suffix: None,
            processor: Arc::new(AcceptAll),
            observers: Vec::new(),
            flow_events: Arc::new(LoggingEventHandler),
            stats: Arc::new(ConsumerStats::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Build a processor from validated configuration
    pub fn from_config(config: &ConsumerConfig) -> Result<Self, ValidationError> {
        Ok(Self::new(config.flow_config()?)
            .with_interval(config.interval())
            .with_grace_period(config.grace_period())
            .with_quit_suffix(config.shutdown.quit_suffix.clone()))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_quit_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.quit_suffix = Some(suffix.into());
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn IntervalObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_flow_events(mut self, handler: Arc<dyn FlowEventHandler>) -> Self {
        self.flow_events = handler;
        self
    }

    /// Coordinator shared with every task of this pipeline
    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    fn listener(&self) -> QueueFlowListener {
        let listener = QueueFlowListener::new(
            Arc::clone(&self.stats),
            Arc::clone(&self.processor),
            Arc::clone(&self.shutdown),
        );
        match &self.quit_suffix {
            Some(suffix) => listener.with_quit_suffix(suffix.clone()),
            None => listener,
        }
    }

    /// Bind, start and monitor until shutdown or `stop`, then drain and close.
    ///
    /// A binding failure returns before anything runs; the session is left
    /// open and the coordinator stays `Running`. A failure to start the bound
    /// flow shuts the pipeline down and is returned as a session error.
    pub async fn run<F>(&self, session: &dyn Session, stop: F) -> Result<RunSummary, FlowBindError>
    where
        F: Future<Output = ()>,
    {
        let flow = FlowController::bind(
            session,
            self.flow_config.clone(),
            Arc::new(self.listener()),
            Arc::clone(&self.flow_events),
        )
        .await?;

        if let Err(e) = flow.start().await {
            error!(queue = %flow.queue(), error = %e, "Failed to start flow");
            self.shutdown.request_shutdown(ShutdownReason::TransportFatal {
                message: e.to_string(),
            });
            if let Err(close_error) = self
                .shutdown
                .drain_and_close(Some(&flow), session, Duration::ZERO)
                .await
            {
                warn!(error = %close_error, "Session close failed after start failure");
            }
            return Err(e.into());
        }

        info!(
            queue = %flow.queue(),
            interval_ms = self.interval.as_millis() as u64,
            "Consuming; waiting for messages"
        );

        let mut monitor = MonitoringLoop::new(
            Arc::clone(&self.stats),
            Arc::clone(&self.shutdown),
            self.interval,
        );
        for observer in &self.observers {
            monitor = monitor.with_observer(Arc::clone(observer));
        }
        let monitor_summary = monitor.run(stop).await;

        if let Err(e) = self
            .shutdown
            .drain_and_close(Some(&flow), session, self.grace_period)
            .await
        {
            warn!(error = %e, "Session did not close cleanly");
        }

        let summary = RunSummary {
            monitor: monitor_summary,
            reason: self.shutdown.reason().cloned(),
            totals: self.stats.snapshot(),
        };
        info!(
            total_received = summary.totals.total_received,
            total_acknowledged = summary.totals.total_acknowledged,
            total_processing_failures = summary.totals.total_processing_failures,
            "Guaranteed processor finished"
        );
        Ok(summary)
    }
}
