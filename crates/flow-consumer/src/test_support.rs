//! Recording test doubles for the broker seam.
//!
//! Every double appends to one shared [`CallLog`] so tests can assert on the
//! relative order of broker calls, acknowledgments and application work.

use crate::error::{AckError, ConsumerError, FlowBindError, SessionError};
use crate::events::FlowEventHandler;
use crate::flow::{AckMode, FlowConfig};
use crate::message::{
    Acknowledger, Destination, InboundMessage, QueueName, ReceiptHandle, TopicSubscription,
};
use crate::session::{DirectConsumer, Flow, MessageListener, Session};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of calls made against the doubles
#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// How [`MockSession::create_flow`] responds
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindBehavior {
    Succeed,
    MissingQueue,
    Unsupported,
    NotConnected,
}

pub(crate) struct MockSession {
    log: CallLog,
    bind: BindBehavior,
    rejected_subscription: Option<String>,
    fail_consumer_start: bool,
    listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
    closed: AtomicBool,
    next_tag: AtomicU64,
}

impl MockSession {
    pub(crate) fn new(log: CallLog) -> Self {
        Self {
            log,
            bind: BindBehavior::Succeed,
            rejected_subscription: None,
            fail_consumer_start: false,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
        }
    }

    pub(crate) fn with_bind(mut self, bind: BindBehavior) -> Self {
        self.bind = bind;
        self
    }

    /// Refuse `add_subscription` for this pattern
    pub(crate) fn with_rejected_subscription(mut self, pattern: &str) -> Self {
        self.rejected_subscription = Some(pattern.to_string());
        self
    }

    /// Make every consumer created by this session fail to start
    pub(crate) fn with_failing_consumer_start(mut self) -> Self {
        self.fail_consumer_start = true;
        self
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Build a client-acknowledged message whose ack lands in the call log
    pub(crate) fn guaranteed_message(&self, redelivered: bool) -> InboundMessage {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let acknowledger = Arc::new(LogAcknowledger {
            log: self.log.clone(),
        });
        InboundMessage::new(
            Destination::Queue(QueueName::new("q_pers_sub".to_string()).unwrap()),
            Bytes::from(format!("payload-{}", tag)),
        )
        .with_redelivered(redelivered)
        .with_receipt(ReceiptHandle::new("flow-1".to_string(), tag, acknowledger))
    }

    /// Deliver a message to every registered listener
    pub(crate) fn deliver(&self, message: InboundMessage) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_receive(message.clone());
        }
    }

    /// Raise an exception on every registered listener
    pub(crate) fn raise(&self, error: ConsumerError) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_exception(error.clone());
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn create_flow(
        &self,
        config: &FlowConfig,
        listener: Arc<dyn MessageListener>,
        _events: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, FlowBindError> {
        self.log.push(format!("create_flow:{}", config.queue));
        match self.bind {
            BindBehavior::Succeed => {
                self.listeners.lock().unwrap().push(listener);
                Ok(Box::new(MockFlow {
                    log: self.log.clone(),
                    queue: config.queue.clone(),
                }))
            }
            BindBehavior::MissingQueue => Err(FlowBindError::QueueMissingOrUnauthorized {
                queue: config.queue.clone(),
                reason: "Unknown Queue".to_string(),
            }),
            BindBehavior::Unsupported => Err(FlowBindError::UnsupportedOperation {
                operation: format!("{} acknowledgment", config.ack_mode),
            }),
            BindBehavior::NotConnected => Err(SessionError::NotConnected.into()),
        }
    }

    async fn create_consumer(
        &self,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn DirectConsumer>, SessionError> {
        self.log.push("create_consumer");
        self.listeners.lock().unwrap().push(listener);
        Ok(Box::new(MockConsumer {
            log: self.log.clone(),
            fail_start: self.fail_consumer_start,
        }))
    }

    async fn add_subscription(&self, subscription: &TopicSubscription) -> Result<(), SessionError> {
        self.log.push(format!("subscribe:{}", subscription));
        if self.rejected_subscription.as_deref() == Some(subscription.as_str()) {
            return Err(SessionError::SubscriptionRejected {
                subscription: subscription.to_string(),
                reason: "Subscription ACL Denied".to_string(),
            });
        }
        Ok(())
    }

    async fn remove_subscription(
        &self,
        subscription: &TopicSubscription,
    ) -> Result<(), SessionError> {
        self.log.push(format!("unsubscribe:{}", subscription));
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.log.push("session.close");
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub(crate) struct MockFlow {
    log: CallLog,
    queue: QueueName,
}

#[async_trait]
impl Flow for MockFlow {
    fn flow_id(&self) -> &str {
        "flow-1"
    }

    fn queue(&self) -> &QueueName {
        &self.queue
    }

    async fn start(&self) -> Result<(), SessionError> {
        self.log.push("flow.start");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SessionError> {
        self.log.push("flow.stop");
        Ok(())
    }
}

pub(crate) struct MockConsumer {
    log: CallLog,
    fail_start: bool,
}

#[async_trait]
impl DirectConsumer for MockConsumer {
    async fn start(&self) -> Result<(), SessionError> {
        self.log.push("consumer.start");
        if self.fail_start {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.log.push("consumer.close");
        Ok(())
    }
}

pub(crate) struct LogAcknowledger {
    pub(crate) log: CallLog,
}

impl Acknowledger for LogAcknowledger {
    fn acknowledge(&self, delivery_tag: u64) -> Result<(), AckError> {
        self.log.push(format!("ack:{}", delivery_tag));
        Ok(())
    }
}

/// Acknowledger whose flow has gone away
pub(crate) struct UnboundAcknowledger;

impl Acknowledger for UnboundAcknowledger {
    fn acknowledge(&self, _delivery_tag: u64) -> Result<(), AckError> {
        Err(AckError::FlowUnbound {
            flow_id: "flow-1".to_string(),
        })
    }
}

pub(crate) fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

pub(crate) fn flow_config(name: &str) -> FlowConfig {
    FlowConfig::new(queue(name)).with_ack_mode(AckMode::Client)
}
