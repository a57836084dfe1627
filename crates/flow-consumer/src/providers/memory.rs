//! In-memory broker implementation for testing and development.
//!
//! This module provides a broker that lives entirely inside the process and
//! implements the [`Session`] seam:
//! - Provisioned durable queues with access control and supported ack modes
//! - Client-acknowledged delivery; unacknowledged messages are redelivered
//!   with the redelivered flag set once their flow goes away
//! - Direct topic subscriptions with a bounded egress buffer; overflow is
//!   reported through the discard indication of the next delivered message
//! - Session and flow events plus transport failure injection
//!
//! Every broker-side action is appended to a journal so tests can assert on
//! what reached the broker and in which order.
//!
//! Listeners are always invoked without holding the broker lock, so a
//! listener may acknowledge, publish or stop its flow from inside the callback.

use crate::config::SessionProperties;
use crate::error::{AckError, ConsumerError, FlowBindError, SessionError};
use crate::events::{FlowEvent, FlowEventHandler, SessionEvent, SessionEventHandler};
use crate::flow::{AckMode, FlowConfig};
use crate::message::{
    Acknowledger, Destination, InboundMessage, MessageId, QueueName, ReceiptHandle,
    TopicSubscription,
};
use crate::session::{DirectConsumer, Flow, MessageListener, Session};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Default number of direct messages buffered per consumer
pub const DEFAULT_EGRESS_BUFFER: usize = 1024;

// ============================================================================
// Provisioning
// ============================================================================

/// Provisioning of one durable queue
#[derive(Debug, Clone)]
pub struct QueueSpec {
    name: QueueName,
    access_granted: bool,
    ack_modes: Vec<AckMode>,
    subscriptions: Vec<TopicSubscription>,
}

impl QueueSpec {
    /// Queue accessible to every client, supporting both ack modes
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            access_granted: true,
            ack_modes: vec![AckMode::Client, AckMode::Auto],
            subscriptions: Vec::new(),
        }
    }

    /// Refuse consume permission to every client
    pub fn deny_access(mut self) -> Self {
        self.access_granted = false;
        self
    }

    /// Restrict the acknowledgment modes flows may bind with
    pub fn with_ack_modes(mut self, ack_modes: Vec<AckMode>) -> Self {
        self.ack_modes = ack_modes;
        self
    }

    /// Attract messages published to matching topics into the queue
    pub fn with_subscription(mut self, subscription: TopicSubscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }
}

/// Broker-side action recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    SessionOpened { session_id: u64 },
    FlowBound { flow_id: String, queue: String },
    FlowStarted { flow_id: String },
    FlowStopped { flow_id: String },
    Acknowledged { flow_id: String, delivery_tag: u64 },
    ConsumerCreated { consumer_id: u64 },
    ConsumerStarted { consumer_id: u64 },
    ConsumerClosed { consumer_id: u64 },
    Subscribed { session_id: u64, subscription: String },
    Unsubscribed { session_id: u64, subscription: String },
    Discarded { consumer_id: u64, topic: String },
    SessionClosed { session_id: u64 },
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored on the broker
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    destination: Destination,
    payload: Bytes,
    delivery_count: u32,
    redelivered: bool,
}

impl StoredMessage {
    fn new(destination: Destination, payload: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            destination,
            payload,
            delivery_count: 0,
            redelivered: false,
        }
    }

    fn into_redelivery(mut self) -> Self {
        self.redelivered = true;
        self
    }
}

struct BrokerQueue {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
}

struct SessionEntry {
    properties: SessionProperties,
    events: Arc<dyn SessionEventHandler>,
    subscriptions: Vec<TopicSubscription>,
    down: bool,
}

struct FlowEntry {
    session_id: u64,
    queue: QueueName,
    ack_mode: AckMode,
    active_flow_indication: bool,
    listener: Arc<dyn MessageListener>,
    events: Arc<dyn FlowEventHandler>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    started: bool,
    halted: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, StoredMessage>,
}

struct ConsumerEntry {
    session_id: u64,
    listener: Arc<dyn MessageListener>,
    sender: mpsc::Sender<InboundMessage>,
    receiver: Option<mpsc::Receiver<InboundMessage>>,
    cancel: CancellationToken,
    pending_discard: bool,
}

struct BrokerState {
    queues: HashMap<QueueName, BrokerQueue>,
    sessions: HashMap<u64, SessionEntry>,
    flows: HashMap<String, FlowEntry>,
    consumers: HashMap<u64, ConsumerEntry>,
    rejected_subscriptions: Vec<String>,
    reachable: bool,
    egress_buffer: usize,
    next_id: u64,
    journal: Vec<BrokerCall>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            sessions: HashMap::new(),
            flows: HashMap::new(),
            consumers: HashMap::new(),
            rejected_subscriptions: Vec::new(),
            reachable: true,
            egress_buffer: DEFAULT_EGRESS_BUFFER,
            next_id: 1,
            journal: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn session_status(&self, session_id: u64) -> Result<&SessionEntry, SessionError> {
        match self.sessions.get(&session_id) {
            None => Err(SessionError::Closed),
            Some(entry) if entry.down => Err(SessionError::NotConnected),
            Some(entry) => Ok(entry),
        }
    }

    /// Put every unacknowledged message of a flow back at the head of its queue
    fn requeue_unacked(&mut self, flow_id: &str) -> usize {
        let Some(flow) = self.flows.get_mut(flow_id) else {
            return 0;
        };
        let unacked = std::mem::take(&mut flow.unacked);
        let queue_name = flow.queue.clone();
        let count = unacked.len();

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            for (_, message) in unacked.into_iter().rev() {
                queue.messages.push_front(message.into_redelivery());
            }
        }
        count
    }

    /// Wake every started flow bound to `queue`
    fn notify_queue(&self, queue: &QueueName) {
        for flow in self.flows.values() {
            if flow.started && &flow.queue == queue {
                flow.notify.notify_one();
            }
        }
    }

    /// Halt delivery on a flow while keeping it bound.
    ///
    /// Unacknowledged deliveries stay with the flow and can still be
    /// acknowledged until the flow is unbound. Returns false if the flow is
    /// unknown or already halted.
    fn halt_flow(&mut self, flow_id: &str) -> bool {
        let Some(flow) = self.flows.get_mut(flow_id) else {
            return false;
        };
        if flow.halted {
            return false;
        }
        flow.halted = true;
        flow.started = false;
        flow.cancel.cancel();
        flow.cancel = CancellationToken::new();
        self.journal.push(BrokerCall::FlowStopped {
            flow_id: flow_id.to_string(),
        });
        true
    }

    /// Halt and unbind a flow, returning its unacknowledged messages to the queue
    fn remove_flow(&mut self, flow_id: &str) -> Option<FlowEntry> {
        self.halt_flow(flow_id);
        let requeued = self.requeue_unacked(flow_id);
        let flow = self.flows.remove(flow_id)?;
        if requeued > 0 {
            debug!(flow_id = %flow_id, requeued, "Unacknowledged messages returned to queue");
        }
        self.notify_queue(&flow.queue);
        Some(flow)
    }

    fn remove_consumer(&mut self, consumer_id: u64) -> bool {
        match self.consumers.remove(&consumer_id) {
            Some(consumer) => {
                consumer.cancel.cancel();
                self.journal.push(BrokerCall::ConsumerClosed { consumer_id });
                true
            }
            None => false,
        }
    }

    /// Take the next message for a started flow, recording it as unacknowledged
    fn next_delivery(
        &mut self,
        state: &Arc<Mutex<BrokerState>>,
        flow_id: &str,
    ) -> Option<(Arc<dyn MessageListener>, InboundMessage)> {
        let flow = self.flows.get_mut(flow_id)?;
        if !flow.started {
            return None;
        }
        let queue = self.queues.get_mut(&flow.queue)?;
        let mut stored = queue.messages.pop_front()?;
        stored.delivery_count += 1;

        let mut message = InboundMessage::new(stored.destination.clone(), stored.payload.clone())
            .with_message_id(stored.message_id.clone())
            .with_redelivered(stored.redelivered)
            .with_delivery_count(stored.delivery_count);

        if flow.ack_mode == AckMode::Client {
            let tag = flow.next_tag;
            flow.next_tag += 1;
            let acknowledger = Arc::new(FlowAcknowledger {
                state: Arc::clone(state),
                flow_id: flow_id.to_string(),
            });
            message =
                message.with_receipt(ReceiptHandle::new(flow_id.to_string(), tag, acknowledger));
            flow.unacked.insert(tag, stored);
        }

        Some((Arc::clone(&flow.listener), message))
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// Broker living in process memory
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    /// Set the per-consumer buffer for direct messages
    pub fn with_egress_buffer(self, capacity: usize) -> Self {
        lock(&self.state).egress_buffer = capacity.max(1);
        self
    }

    /// Create or replace a durable queue. Messages already queued are kept.
    pub fn provision_queue(&self, spec: QueueSpec) {
        let mut state = lock(&self.state);
        info!(queue = %spec.name, access_granted = spec.access_granted, "Provisioning queue");
        match state.queues.get_mut(&spec.name) {
            Some(queue) => queue.spec = spec,
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    BrokerQueue {
                        spec,
                        messages: VecDeque::new(),
                    },
                );
            }
        }
    }

    /// Make the broker refuse or accept new connections
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Reject future subscriptions with exactly this pattern
    pub fn reject_subscription(&self, pattern: &str) {
        lock(&self.state).rejected_subscriptions.push(pattern.to_string());
    }

    /// Open a session.
    ///
    /// The in-memory broker accepts any credentials.
    pub async fn connect(
        &self,
        properties: &SessionProperties,
        events: Arc<dyn SessionEventHandler>,
    ) -> Result<InMemorySession, SessionError> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(SessionError::ConnectionRefused {
                host: properties.host.clone(),
                reason: "broker unreachable".to_string(),
            });
        }

        let session_id = state.next_id();
        state.sessions.insert(
            session_id,
            SessionEntry {
                properties: properties.clone(),
                events,
                subscriptions: Vec::new(),
                down: false,
            },
        );
        state.journal.push(BrokerCall::SessionOpened { session_id });
        info!(
            session_id,
            host = %properties.host,
            vpn = %properties.vpn,
            username = %properties.username,
            "Session connected"
        );

        Ok(InMemorySession {
            state: Arc::clone(&self.state),
            session_id,
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a message directly on a queue
    pub fn publish_to_queue(
        &self,
        queue: &QueueName,
        payload: Bytes,
    ) -> Result<MessageId, SessionError> {
        let mut state = lock(&self.state);
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(SessionError::Operation {
                operation: "publish".to_string(),
                message: format!("queue '{}' does not exist", queue),
            });
        };

        let stored = StoredMessage::new(Destination::Queue(queue.clone()), payload);
        let message_id = stored.message_id.clone();
        target.messages.push_back(stored);
        state.notify_queue(queue);
        Ok(message_id)
    }

    /// Publish to a topic.
    ///
    /// The message is copied into every queue whose subscriptions match and
    /// offered to every started direct consumer whose session subscribes to
    /// the topic. Returns the number of queues and consumers that matched.
    pub fn publish_to_topic(&self, topic: &str, payload: Bytes) -> usize {
        let mut state = lock(&self.state);
        let state = &mut *state;
        let mut matched = 0;

        let mut woken = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if queue.spec.subscriptions.iter().any(|s| s.matches(topic)) {
                queue
                    .messages
                    .push_back(StoredMessage::new(Destination::topic(topic), payload.clone()));
                woken.push(name.clone());
                matched += 1;
            }
        }
        for name in &woken {
            state.notify_queue(name);
        }

        for (consumer_id, consumer) in state.consumers.iter_mut() {
            let subscribed = state
                .sessions
                .get(&consumer.session_id)
                .is_some_and(|s| !s.down && s.subscriptions.iter().any(|sub| sub.matches(topic)));
            if !subscribed {
                continue;
            }
            matched += 1;

            let message = InboundMessage::new(Destination::topic(topic), payload.clone())
                .with_discard_indication(consumer.pending_discard);
            match consumer.sender.try_send(message) {
                Ok(()) => consumer.pending_discard = false,
                Err(_) => {
                    consumer.pending_discard = true;
                    state.journal.push(BrokerCall::Discarded {
                        consumer_id: *consumer_id,
                        topic: topic.to_string(),
                    });
                }
            }
        }

        matched
    }

    /// Return every unacknowledged message of `queue` for redelivery
    pub fn redeliver_unacked(&self, queue: &QueueName) -> usize {
        let mut state = lock(&self.state);
        let flow_ids: Vec<String> = state
            .flows
            .iter()
            .filter(|(_, f)| &f.queue == queue)
            .map(|(id, _)| id.clone())
            .collect();
        let count: usize = flow_ids
            .iter()
            .map(|id| state.requeue_unacked(id))
            .sum();
        state.notify_queue(queue);
        count
    }

    /// Drop and restore the transport of every open session.
    ///
    /// Acknowledgments that have not reached the broker are lost: every
    /// unacknowledged message is redelivered once the flows rebind.
    pub fn interrupt_transport(&self) {
        let (session_handlers, flow_handlers) = {
            let mut state = lock(&self.state);
            let flow_ids: Vec<String> = state.flows.keys().cloned().collect();
            for flow_id in &flow_ids {
                state.requeue_unacked(flow_id);
            }

            let session_handlers: Vec<Arc<dyn SessionEventHandler>> = state
                .sessions
                .values()
                .filter(|s| !s.down)
                .map(|s| Arc::clone(&s.events))
                .collect();
            let flow_handlers: Vec<(String, Arc<dyn FlowEventHandler>)> = state
                .flows
                .iter()
                .map(|(id, f)| (id.clone(), Arc::clone(&f.events)))
                .collect();
            (session_handlers, flow_handlers)
        };

        warn!("Transport interrupted; reconnecting");
        for handler in &session_handlers {
            handler.on_session_event(SessionEvent::Reconnecting { attempt: 1 });
        }
        for (flow_id, handler) in &flow_handlers {
            handler.on_flow_event(flow_id, FlowEvent::Reconnecting);
        }
        for handler in &session_handlers {
            handler.on_session_event(SessionEvent::Reconnected);
        }
        for (flow_id, handler) in &flow_handlers {
            handler.on_flow_event(flow_id, FlowEvent::Reconnected);
        }

        let state = lock(&self.state);
        for flow in state.flows.values().filter(|f| f.started) {
            flow.notify.notify_one();
        }
    }

    /// Lose the transport of every open session for good.
    ///
    /// Sessions raise a down event, flows a down event, and every listener
    /// bound to those sessions receives a fatal transport exception.
    pub fn fail_transport(&self, message: &str) {
        let (session_handlers, flow_handlers, listeners) = {
            let mut state = lock(&self.state);
            let mut down_sessions = Vec::new();
            let mut session_handlers = Vec::new();
            for (id, session) in state.sessions.iter_mut() {
                if !session.down {
                    session.down = true;
                    down_sessions.push(*id);
                    session_handlers.push(Arc::clone(&session.events));
                }
            }

            let mut flow_handlers = Vec::new();
            let mut listeners: Vec<Arc<dyn MessageListener>> = Vec::new();
            for (flow_id, flow) in state.flows.iter_mut() {
                if down_sessions.contains(&flow.session_id) {
                    flow.started = false;
                    flow_handlers.push((flow_id.clone(), Arc::clone(&flow.events)));
                    listeners.push(Arc::clone(&flow.listener));
                }
            }
            for consumer in state.consumers.values() {
                if down_sessions.contains(&consumer.session_id) {
                    consumer.cancel.cancel();
                    listeners.push(Arc::clone(&consumer.listener));
                }
            }
            (session_handlers, flow_handlers, listeners)
        };

        warn!(reason = %message, "Transport failed");
        for handler in &session_handlers {
            handler.on_session_event(SessionEvent::DownError {
                message: message.to_string(),
            });
        }
        for (flow_id, handler) in &flow_handlers {
            handler.on_flow_event(
                flow_id,
                FlowEvent::DownError {
                    message: message.to_string(),
                },
            );
        }
        let error = ConsumerError::TransportFatal {
            message: message.to_string(),
        };
        for listener in &listeners {
            listener.on_exception(error.clone());
        }
    }

    /// Messages waiting on a queue, excluding unacknowledged deliveries
    pub fn queue_depth(&self, queue: &QueueName) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Deliveries on `queue` that have not been acknowledged yet
    pub fn unacked_count(&self, queue: &QueueName) -> usize {
        lock(&self.state)
            .flows
            .values()
            .filter(|f| &f.queue == queue)
            .map(|f| f.unacked.len())
            .sum()
    }

    /// Every broker-side action so far, oldest first
    pub fn journal(&self) -> Vec<BrokerCall> {
        lock(&self.state).journal.clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// InMemorySession
// ============================================================================

/// Session connected to an [`InMemoryBroker`]
pub struct InMemorySession {
    state: Arc<Mutex<BrokerState>>,
    session_id: u64,
    closed: AtomicBool,
}

impl InMemorySession {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Reconnect policy the session was opened with
    pub fn properties(&self) -> Option<SessionProperties> {
        lock(&self.state)
            .sessions
            .get(&self.session_id)
            .map(|s| s.properties.clone())
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn create_flow(
        &self,
        config: &FlowConfig,
        listener: Arc<dyn MessageListener>,
        events: Arc<dyn FlowEventHandler>,
    ) -> Result<Box<dyn Flow>, FlowBindError> {
        let mut state = lock(&self.state);
        state.session_status(self.session_id)?;

        let spec = match state.queues.get(&config.queue) {
            None => {
                return Err(FlowBindError::QueueMissingOrUnauthorized {
                    queue: config.queue.clone(),
                    reason: "Unknown Queue".to_string(),
                })
            }
            Some(queue) if !queue.spec.access_granted => {
                return Err(FlowBindError::QueueMissingOrUnauthorized {
                    queue: config.queue.clone(),
                    reason: "Permission Not Allowed".to_string(),
                })
            }
            Some(queue) => &queue.spec,
        };

        if !spec.ack_modes.contains(&config.ack_mode) {
            return Err(FlowBindError::UnsupportedOperation {
                operation: format!("{} acknowledgment on queue '{}'", config.ack_mode, config.queue),
            });
        }

        let flow_id = format!("flow-{}", state.next_id());
        state.flows.insert(
            flow_id.clone(),
            FlowEntry {
                session_id: self.session_id,
                queue: config.queue.clone(),
                ack_mode: config.ack_mode,
                active_flow_indication: config.active_flow_indication,
                listener,
                events,
                notify: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
                started: false,
                halted: false,
                next_tag: 1,
                unacked: BTreeMap::new(),
            },
        );
        state.journal.push(BrokerCall::FlowBound {
            flow_id: flow_id.clone(),
            queue: config.queue.to_string(),
        });

        Ok(Box::new(InMemoryFlow {
            state: Arc::clone(&self.state),
            flow_id,
            queue: config.queue.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn DirectConsumer>, SessionError> {
        let mut state = lock(&self.state);
        state.session_status(self.session_id)?;

        let consumer_id = state.next_id();
        let (sender, receiver) = mpsc::channel(state.egress_buffer);
        state.consumers.insert(
            consumer_id,
            ConsumerEntry {
                session_id: self.session_id,
                listener,
                sender,
                receiver: Some(receiver),
                cancel: CancellationToken::new(),
                pending_discard: false,
            },
        );
        state.journal.push(BrokerCall::ConsumerCreated { consumer_id });

        Ok(Box::new(InMemoryConsumer {
            state: Arc::clone(&self.state),
            consumer_id,
        }))
    }

    async fn add_subscription(&self, subscription: &TopicSubscription) -> Result<(), SessionError> {
        let events = {
            let mut state = lock(&self.state);
            let events = Arc::clone(&state.session_status(self.session_id)?.events);

            if !state
                .rejected_subscriptions
                .iter()
                .any(|p| p == subscription.as_str())
            {
                if let Some(session) = state.sessions.get_mut(&self.session_id) {
                    if !session.subscriptions.contains(subscription) {
                        session.subscriptions.push(subscription.clone());
                    }
                }
                state.journal.push(BrokerCall::Subscribed {
                    session_id: self.session_id,
                    subscription: subscription.to_string(),
                });
                return Ok(());
            }
            events
        };

        let reason = "Subscription ACL Denied".to_string();
        events.on_session_event(SessionEvent::SubscriptionError {
            subscription: subscription.to_string(),
            reason: reason.clone(),
        });
        Err(SessionError::SubscriptionRejected {
            subscription: subscription.to_string(),
            reason,
        })
    }

    async fn remove_subscription(
        &self,
        subscription: &TopicSubscription,
    ) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        state.session_status(self.session_id)?;

        if let Some(session) = state.sessions.get_mut(&self.session_id) {
            session.subscriptions.retain(|s| s != subscription);
        }
        state.journal.push(BrokerCall::Unsubscribed {
            session_id: self.session_id,
            subscription: subscription.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = lock(&self.state);
        let flow_ids: Vec<String> = state
            .flows
            .iter()
            .filter(|(_, f)| f.session_id == self.session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for flow_id in &flow_ids {
            state.remove_flow(flow_id);
        }

        let consumer_ids: Vec<u64> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.session_id == self.session_id)
            .map(|(id, _)| *id)
            .collect();
        for consumer_id in consumer_ids {
            state.remove_consumer(consumer_id);
        }

        state.sessions.remove(&self.session_id);
        state.journal.push(BrokerCall::SessionClosed {
            session_id: self.session_id,
        });
        info!(session_id = self.session_id, "Session closed by client");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// InMemoryFlow
// ============================================================================

/// Flow bound to a queue of an [`InMemoryBroker`]
pub struct InMemoryFlow {
    state: Arc<Mutex<BrokerState>>,
    flow_id: String,
    queue: QueueName,
}

#[async_trait]
impl Flow for InMemoryFlow {
    fn flow_id(&self) -> &str {
        &self.flow_id
    }

    fn queue(&self) -> &QueueName {
        &self.queue
    }

    async fn start(&self) -> Result<(), SessionError> {
        let (notify, cancel, active_events) = {
            let mut state = lock(&self.state);
            let session_id = match state.flows.get(&self.flow_id) {
                Some(flow) => flow.session_id,
                None => return Err(SessionError::Closed),
            };
            state.session_status(session_id)?;

            let Some(flow) = state.flows.get_mut(&self.flow_id) else {
                return Err(SessionError::Closed);
            };
            if flow.started {
                return Ok(());
            }
            flow.started = true;
            flow.halted = false;
            let notify = Arc::clone(&flow.notify);
            let cancel = flow.cancel.clone();
            let active_events = flow
                .active_flow_indication
                .then(|| Arc::clone(&flow.events));
            state.journal.push(BrokerCall::FlowStarted {
                flow_id: self.flow_id.clone(),
            });
            (notify, cancel, active_events)
        };

        tokio::spawn(run_flow_delivery(
            Arc::clone(&self.state),
            self.flow_id.clone(),
            Arc::clone(&notify),
            cancel,
        ));
        notify.notify_one();

        if let Some(events) = active_events {
            events.on_flow_event(&self.flow_id, FlowEvent::Active);
        }
        Ok(())
    }

    /// Halt delivery. The flow stays bound so in-flight deliveries can
    /// still be acknowledged; closing the session unbinds it.
    async fn stop(&self) -> Result<(), SessionError> {
        if !lock(&self.state).halt_flow(&self.flow_id) {
            debug!(flow_id = %self.flow_id, "Flow already stopped");
        }
        Ok(())
    }
}

async fn run_flow_delivery(
    state: Arc<Mutex<BrokerState>>,
    flow_id: String,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        loop {
            let next = lock(&state).next_delivery(&state, &flow_id);
            let Some((listener, message)) = next else {
                break;
            };
            listener.on_receive(message);
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                return;
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            _ = notify.notified() => {}
        }
    }
}

/// Acknowledgment path of one in-memory flow
struct FlowAcknowledger {
    state: Arc<Mutex<BrokerState>>,
    flow_id: String,
}

impl Acknowledger for FlowAcknowledger {
    fn acknowledge(&self, delivery_tag: u64) -> Result<(), AckError> {
        let mut state = lock(&self.state);
        let Some(flow) = state.flows.get_mut(&self.flow_id) else {
            return Err(AckError::FlowUnbound {
                flow_id: self.flow_id.clone(),
            });
        };
        if flow.unacked.remove(&delivery_tag).is_none() {
            return Err(AckError::UnknownDelivery {
                flow_id: self.flow_id.clone(),
                delivery_tag,
            });
        }
        state.journal.push(BrokerCall::Acknowledged {
            flow_id: self.flow_id.clone(),
            delivery_tag,
        });
        Ok(())
    }
}

// ============================================================================
// InMemoryConsumer
// ============================================================================

/// Direct consumer of an [`InMemorySession`]
pub struct InMemoryConsumer {
    state: Arc<Mutex<BrokerState>>,
    consumer_id: u64,
}

#[async_trait]
impl DirectConsumer for InMemoryConsumer {
    async fn start(&self) -> Result<(), SessionError> {
        let (receiver, listener, cancel) = {
            let mut state = lock(&self.state);
            let session_id = match state.consumers.get(&self.consumer_id) {
                Some(consumer) => consumer.session_id,
                None => return Err(SessionError::Closed),
            };
            state.session_status(session_id)?;

            let Some(consumer) = state.consumers.get_mut(&self.consumer_id) else {
                return Err(SessionError::Closed);
            };
            let Some(receiver) = consumer.receiver.take() else {
                return Ok(());
            };
            let listener = Arc::clone(&consumer.listener);
            let cancel = consumer.cancel.clone();
            state.journal.push(BrokerCall::ConsumerStarted {
                consumer_id: self.consumer_id,
            });
            (receiver, listener, cancel)
        };

        tokio::spawn(run_consumer_delivery(receiver, listener, cancel));
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if !lock(&self.state).remove_consumer(self.consumer_id) {
            debug!(consumer_id = self.consumer_id, "Consumer already closed");
        }
        Ok(())
    }
}

async fn run_consumer_delivery(
    mut receiver: mpsc::Receiver<InboundMessage>,
    listener: Arc<dyn MessageListener>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            message = receiver.recv() => match message {
                Some(message) => {
                    listener.on_receive(message);
                    tokio::task::yield_now().await;
                }
                None => return,
            },
        }
    }
}
