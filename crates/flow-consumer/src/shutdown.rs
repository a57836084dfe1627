//! Shutdown coordination.
//!
//! The coordinator owns a linear state machine:
//!
//! ```text
//! Running ──request_shutdown()──► Draining ──drain_and_close()──► Closed
//! ```
//!
//! Any task may request shutdown; only the first request moves the state and
//! records its [`ShutdownReason`]. The shutdown gate is a
//! [`CancellationToken`], so once it is set it stays set and every waiter is
//! released immediately. Only the controlling task runs
//! [`ShutdownCoordinator::drain_and_close`], and it runs at most once.

use crate::error::SessionError;
use crate::session::Session;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "shutdown_tests.rs"]
mod tests;

// ============================================================================
// States and Reasons
// ============================================================================

/// Lifecycle state of a consumption pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownState {
    Running,
    Draining,
    Closed,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_RUNNING => Self::Running,
            STATE_DRAINING => Self::Draining,
            _ => Self::Closed,
        }
    }
}

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Why the pipeline left the running state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ShutdownReason {
    /// Transport lost after all reconnect attempts
    TransportFatal { message: String },
    /// Application-level quit message received
    QuitMessage { destination: String },
    /// Operator ended input on the control stream
    OperatorInput,
    /// Process received a termination signal
    Signal,
    /// Monitoring loop ended on its external stop condition
    MonitorStopped,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportFatal { message } => write!(f, "transport failure: {}", message),
            Self::QuitMessage { destination } => write!(f, "quit message on '{}'", destination),
            Self::OperatorInput => write!(f, "operator input"),
            Self::Signal => write!(f, "termination signal"),
            Self::MonitorStopped => write!(f, "monitoring stopped"),
        }
    }
}

/// Something whose message delivery can be halted before the session closes
#[async_trait]
pub trait Drainable: Send + Sync {
    /// Stop accepting new deliveries. In-flight callbacks are not cancelled.
    async fn stop_delivery(&self) -> Result<(), SessionError>;
}

// ============================================================================
// Shutdown Coordinator
// ============================================================================

/// Single shutdown gate shared by every task of a pipeline
pub struct ShutdownCoordinator {
    state: AtomicU8,
    gate: CancellationToken,
    reason: OnceLock<ShutdownReason>,
    closing: AtomicBool,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the running state
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_RUNNING),
            gate: CancellationToken::new(),
            reason: OnceLock::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reason recorded by the first shutdown request
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    /// Check the shutdown gate. Once `true`, never `false` again.
    pub fn is_shutdown_requested(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// Wait until shutdown has been requested
    pub async fn cancelled(&self) {
        self.gate.cancelled().await
    }

    /// Token released together with the shutdown gate.
    ///
    /// Cancelling the returned token does not request shutdown.
    pub fn child_token(&self) -> CancellationToken {
        self.gate.child_token()
    }

    /// Move from `Running` to `Draining`.
    ///
    /// Returns `true` only for the request that performed the transition;
    /// later requests are ignored and their reasons dropped.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        match self.state.compare_exchange(
            STATE_RUNNING,
            STATE_DRAINING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(reason = %reason, "Shutdown requested");
                let _ = self.reason.set(reason);
                self.gate.cancel();
                true
            }
            Err(_) => {
                debug!(reason = %reason, "Shutdown already in progress");
                false
            }
        }
    }

    /// Stop delivery, wait out the grace period, then close the session.
    ///
    /// The grace period lets acknowledgments already handed to the transport
    /// reach the broker. Acknowledgments still in flight when the session
    /// closes are lost and those messages are redelivered on the next bind.
    ///
    /// Returns `Ok(true)` when this call closed the pipeline and `Ok(false)`
    /// when it had already been closed. The state reaches `Closed` even if
    /// closing the session fails.
    pub async fn drain_and_close(
        &self,
        delivery: Option<&dyn Drainable>,
        session: &dyn Session,
        grace_period: Duration,
    ) -> Result<bool, SessionError> {
        if self.state() == ShutdownState::Running {
            self.request_shutdown(ShutdownReason::MonitorStopped);
        }

        if self.closing.swap(true, Ordering::AcqRel) {
            debug!("Pipeline already closing");
            return Ok(false);
        }

        info!(grace_period_ms = grace_period.as_millis() as u64, "Draining");

        if let Some(delivery) = delivery {
            if let Err(e) = delivery.stop_delivery().await {
                warn!(error = %e, "Failed to stop delivery; closing session anyway");
            }
        }

        if !grace_period.is_zero() {
            tokio::time::sleep(grace_period).await;
        }

        let result = session.close().await;
        self.state.store(STATE_CLOSED, Ordering::Release);

        match result {
            Ok(()) => {
                info!("Session closed");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Session close failed");
                Err(e)
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
