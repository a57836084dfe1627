//! Direct (non-guaranteed) subscription pipeline.
//!
//! Direct messages carry no receipt and are never acknowledged. The broker
//! may drop them when the consumer falls behind; it then sets the discard
//! indication on the next message it does deliver, which raises the discard
//! anomaly for the current interval.

use crate::anomaly::DeliveryAnomalyDetector;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, SessionError, ValidationError};
use crate::message::{InboundMessage, TopicSubscription};
use crate::monitor::{IntervalObserver, MonitoringLoop, DEFAULT_INTERVAL};
use crate::processor::{AcceptAll, MessageProcessor, RunSummary, DEFAULT_GRACE_PERIOD};
use crate::session::{DirectConsumer, MessageListener, Session};
use crate::shutdown::{Drainable, ShutdownCoordinator, ShutdownReason};
use crate::stats::ConsumerStats;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "subscriber_tests.rs"]
mod tests;

// ============================================================================
// Direct Message Listener
// ============================================================================

/// Receive callback of a direct consumer
pub struct DirectMessageListener {
    stats: Arc<ConsumerStats>,
    detector: DeliveryAnomalyDetector,
    processor: Arc<dyn MessageProcessor>,
    shutdown: Arc<ShutdownCoordinator>,
    quit_suffix: Option<String>,
}

impl DirectMessageListener {
    pub fn new(
        stats: Arc<ConsumerStats>,
        processor: Arc<dyn MessageProcessor>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            detector: DeliveryAnomalyDetector::new(Arc::clone(&stats)),
            stats,
            processor,
            shutdown,
            quit_suffix: None,
        }
    }

    pub fn with_quit_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.quit_suffix = Some(suffix.into());
        self
    }
}

impl MessageListener for DirectMessageListener {
    fn on_receive(&self, message: InboundMessage) {
        self.stats.record_received();
        self.detector.has_discard_indication(&message);

        if let Some(suffix) = self.quit_suffix.as_deref() {
            if message.destination.has_suffix(suffix) {
                self.shutdown.request_shutdown(ShutdownReason::QuitMessage {
                    destination: message.destination.name().to_string(),
                });
                return;
            }
        }

        if let Err(e) = self.processor.process(&message) {
            self.stats.record_processing_failure();
            warn!(
                message_id = %message.message_id,
                destination = %message.destination,
                error = %e,
                "Direct message processing failed; message is lost"
            );
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

/// Direct consumer handed to the shutdown coordinator for draining
struct ConsumerDelivery {
    consumer: Box<dyn DirectConsumer>,
}

#[async_trait]
impl Drainable for ConsumerDelivery {
    async fn stop_delivery(&self) -> Result<(), SessionError> {
        self.consumer.close().await
    }
}

// ============================================================================
// Direct Subscriber
// ============================================================================

/// Consumes direct messages from topic subscriptions until shutdown
pub struct DirectSubscriber {
    subscriptions: Vec<TopicSubscription>,
    interval: Duration,
    grace_period: Duration,
    quit_suffix: Option<String>,
    processor: Arc<dyn MessageProcessor>,
    observers: Vec<Arc<dyn IntervalObserver>>,
    stats: Arc<ConsumerStats>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl DirectSubscriber {
    pub fn new(subscriptions: Vec<TopicSubscription>) -> Self {
        Self {
            subscriptions,
            interval: DEFAULT_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            quit_suffix: None,
            processor: Arc::new(AcceptAll),
            observers: Vec::new(),
            stats: Arc::new(ConsumerStats::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Result<Self, ValidationError> {
        Ok(Self::new(config.topic_subscriptions()?)
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

    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    fn listener(&self) -> DirectMessageListener {
        let listener = DirectMessageListener::new(
            Arc::clone(&self.stats),
            Arc::clone(&self.processor),
            Arc::clone(&self.shutdown),
        );
        match &self.quit_suffix {
            Some(suffix) => listener.with_quit_suffix(suffix.clone()),
            None => listener,
        }
    }

    /// Remove subscriptions added by a run that failed to start
    async fn rollback_subscriptions(&self, session: &dyn Session, applied: &[TopicSubscription]) {
        for subscription in applied.iter().rev() {
            if let Err(e) = session.remove_subscription(subscription).await {
                warn!(subscription = %subscription, error = %e, "Failed to remove subscription");
            }
        }
    }

    /// Subscribe, start and monitor until shutdown or `stop`, then drain and
    /// close.
    ///
    /// If a subscription is rejected, the subscriptions already added are
    /// removed, the consumer is closed and the error returned; the session is
    /// left open. A failure to start the consumer shuts the pipeline down like
    /// a transport failure.
    pub async fn run<F>(&self, session: &dyn Session, stop: F) -> Result<RunSummary, SessionError>
    where
        F: Future<Output = ()>,
    {
        let consumer = session.create_consumer(Arc::new(self.listener())).await?;

        let mut applied = Vec::with_capacity(self.subscriptions.len());
        for subscription in &self.subscriptions {
            if let Err(e) = session.add_subscription(subscription).await {
                error!(subscription = %subscription, error = %e, "Subscription rejected");
                self.rollback_subscriptions(session, &applied).await;
                if let Err(close_error) = consumer.close().await {
                    warn!(error = %close_error, "Failed to close consumer");
                }
                return Err(e);
            }
            info!(subscription = %subscription, "Subscribed");
            applied.push(subscription.clone());
        }

        let delivery = ConsumerDelivery { consumer };
        if let Err(e) = delivery.consumer.start().await {
            error!(error = %e, "Failed to start consumer");
            self.shutdown.request_shutdown(ShutdownReason::TransportFatal {
                message: e.to_string(),
            });
            self.rollback_subscriptions(session, &applied).await;
            if let Err(close_error) = self
                .shutdown
                .drain_and_close(Some(&delivery), session, Duration::ZERO)
                .await
            {
                warn!(error = %close_error, "Session close failed after start failure");
            }
            return Err(e);
        }

        info!(
            subscriptions = self.subscriptions.len(),
            interval_ms = self.interval.as_millis() as u64,
            "Direct consumer started; waiting for messages"
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
            .drain_and_close(Some(&delivery), session, self.grace_period)
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
            "Direct subscriber finished"
        );
        Ok(summary)
    }
}
