//! Flow controller: binds a durable queue to a receiving flow.
//!
//! Binding failures are never retried here. A missing or unauthorized queue is
//! reported with operator guidance; an unsupported acknowledgment mode is a
//! fatal startup error that the caller must propagate.

use crate::error::{FlowBindError, SessionError};
use crate::events::FlowEventHandler;
use crate::message::QueueName;
use crate::session::{Flow, MessageListener, Session};
use crate::shutdown::Drainable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "flow_tests.rs"]
mod tests;

// ============================================================================
// Flow Configuration
// ============================================================================

/// Who acknowledges delivered messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The client acknowledges each message explicitly
    #[default]
    Client,
    /// The broker treats delivery as acknowledgment
    Auto,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Properties of a flow binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    pub queue: QueueName,
    pub ack_mode: AckMode,
    /// Ask the broker for active/inactive flow events
    pub active_flow_indication: bool,
}

impl FlowConfig {
    /// Client-acknowledged flow with active-flow indication
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            ack_mode: AckMode::Client,
            active_flow_indication: true,
        }
    }

    /// Set acknowledgment mode
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Enable or disable active-flow indication
    pub fn with_active_flow_indication(mut self, enabled: bool) -> Self {
        self.active_flow_indication = enabled;
        self
    }
}

// ============================================================================
// Flow Controller
// ============================================================================

/// Binds queues to flows on a connected session
pub struct FlowController;

impl FlowController {
    /// Bind a flow to the configured queue.
    ///
    /// The returned flow is bound but not started.
    pub async fn bind(
        session: &dyn Session,
        config: FlowConfig,
        listener: Arc<dyn MessageListener>,
        events: Arc<dyn FlowEventHandler>,
    ) -> Result<BoundFlow, FlowBindError> {
        info!(
            queue = %config.queue,
            ack_mode = %config.ack_mode,
            "Attempting to bind to queue"
        );

        match session.create_flow(&config, listener, events).await {
            Ok(flow) => {
                info!(queue = %config.queue, flow_id = %flow.flow_id(), "Bound to queue");
                Ok(BoundFlow::new(flow, config))
            }
            Err(e) => {
                match &e {
                    FlowBindError::QueueMissingOrUnauthorized { queue, reason } => {
                        error!(queue = %queue, reason = %reason, "Could not bind to queue");
                    }
                    FlowBindError::UnsupportedOperation { operation } => {
                        error!(
                            queue = %config.queue,
                            operation = %operation,
                            "Broker does not support the requested flow configuration"
                        );
                    }
                    FlowBindError::Session(session_error) => {
                        error!(queue = %config.queue, error = %session_error, "Session failed while binding");
                    }
                }
                Err(e)
            }
        }
    }
}

// ============================================================================
// Bound Flow
// ============================================================================

const FLOW_BOUND: u8 = 0;
const FLOW_STARTED: u8 = 1;
const FLOW_STOPPED: u8 = 2;

/// A flow bound to its queue.
///
/// `start` and `stop` are idempotent, and `stop` reaches the broker at most
/// once. A stopped flow cannot be restarted.
pub struct BoundFlow {
    flow: Box<dyn Flow>,
    config: FlowConfig,
    state: AtomicU8,
}

impl BoundFlow {
    fn new(flow: Box<dyn Flow>, config: FlowConfig) -> Self {
        Self {
            flow,
            config,
            state: AtomicU8::new(FLOW_BOUND),
        }
    }

    pub fn flow_id(&self) -> &str {
        self.flow.flow_id()
    }

    pub fn queue(&self) -> &QueueName {
        &self.config.queue
    }

    pub fn ack_mode(&self) -> AckMode {
        self.config.ack_mode
    }

    /// Check if the flow is currently delivering
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == FLOW_STARTED
    }

    /// Tell the broker to start delivering messages on this flow
    pub async fn start(&self) -> Result<(), SessionError> {
        match self.state.compare_exchange(
            FLOW_BOUND,
            FLOW_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if let Err(e) = self.flow.start().await {
                    let _ = self.state.compare_exchange(
                        FLOW_STARTED,
                        FLOW_BOUND,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Err(e);
                }
                info!(queue = %self.config.queue, flow_id = %self.flow_id(), "Flow started");
                Ok(())
            }
            Err(FLOW_STOPPED) => Err(SessionError::Closed),
            Err(_) => Ok(()),
        }
    }

    /// Halt delivery. Acknowledgments of messages already delivered are
    /// accepted until the session closes.
    ///
    /// Returns `Ok(true)` when this call stopped the flow and `Ok(false)` when
    /// it had already been stopped.
    pub async fn stop(&self) -> Result<bool, SessionError> {
        if self.state.swap(FLOW_STOPPED, Ordering::AcqRel) == FLOW_STOPPED {
            debug!(flow_id = %self.flow_id(), "Flow already stopped");
            return Ok(false);
        }

        self.flow.stop().await?;
        info!(queue = %self.config.queue, flow_id = %self.flow_id(), "Flow stopped");
        Ok(true)
    }
}

#[async_trait]
impl Drainable for BoundFlow {
    async fn stop_delivery(&self) -> Result<(), SessionError> {
        self.stop().await.map(|_| ())
    }
}
