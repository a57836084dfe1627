//! Periodic monitoring of a running pipeline.
//!
//! Once per interval the loop swaps the received-message counter back to
//! zero, reads and clears both anomaly flags, and hands the resulting
//! [`IntervalRecord`] to every registered [`IntervalObserver`]. Each anomaly
//! is therefore reported at most once per interval no matter how many
//! messages triggered it.

use crate::shutdown::ShutdownCoordinator;
use crate::stats::ConsumerStats;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;

/// Default time between monitor ticks
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Interval Records
// ============================================================================

/// What happened during one monitoring interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntervalRecord {
    pub messages_per_interval: u64,
    pub redelivery_anomaly: bool,
    pub discard_anomaly: bool,
}

impl IntervalRecord {
    pub fn has_anomaly(&self) -> bool {
        self.redelivery_anomaly || self.discard_anomaly
    }
}

/// Sink for interval records.
///
/// Called on the monitoring task; implementations must not block.
pub trait IntervalObserver: Send + Sync {
    fn on_interval(&self, record: &IntervalRecord);
}

/// Observer that writes each record to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl IntervalObserver for LoggingObserver {
    fn on_interval(&self, record: &IntervalRecord) {
        info!(
            messages_per_interval = record.messages_per_interval,
            "Received msgs/s: {}", record.messages_per_interval
        );
    }
}

/// Observer forwarding records to a channel
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<IntervalRecord>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IntervalRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl IntervalObserver for ChannelObserver {
    fn on_interval(&self, record: &IntervalRecord) {
        // Receiver gone means nobody is listening any more
        let _ = self.sender.send(*record);
    }
}

/// Observer that keeps every record in memory
#[derive(Debug, Default)]
pub struct RecordingObserver {
    records: Mutex<Vec<IntervalRecord>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records received so far, oldest first
    pub fn records(&self) -> Vec<IntervalRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IntervalObserver for RecordingObserver {
    fn on_interval(&self, record: &IntervalRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(*record),
            Err(poisoned) => poisoned.into_inner().push(*record),
        }
    }
}

// ============================================================================
// Monitoring Loop
// ============================================================================

/// Why the monitoring loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorExit {
    /// The shutdown gate was set
    Shutdown,
    /// The external stop condition completed
    Stopped,
}

/// Result of a monitoring run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub exit: MonitorExit,
    pub ticks: u64,
}

/// Samples shared statistics once per interval until shutdown
pub struct MonitoringLoop {
    stats: Arc<ConsumerStats>,
    shutdown: Arc<ShutdownCoordinator>,
    interval: Duration,
    observers: Vec<Arc<dyn IntervalObserver>>,
}

impl MonitoringLoop {
    pub fn new(
        stats: Arc<ConsumerStats>,
        shutdown: Arc<ShutdownCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            stats,
            shutdown,
            interval,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn IntervalObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take one sample, resetting the interval counter and both flags
    pub fn sample(&self) -> IntervalRecord {
        IntervalRecord {
            messages_per_interval: self.stats.take_interval_count(),
            redelivery_anomaly: self.stats.redelivery().take(),
            discard_anomaly: self.stats.discard().take(),
        }
    }

    fn emit(&self, record: &IntervalRecord) {
        for observer in &self.observers {
            observer.on_interval(record);
        }

        if record.redelivery_anomaly {
            warn!("Message redelivery detected: a message was delivered more than once");
        }
        if record.discard_anomaly {
            warn!("Message discard detected: messages were dropped before delivery");
        }
    }

    /// Tick until shutdown is requested or `stop` completes.
    ///
    /// The first tick fires one interval after the call. Both exit conditions
    /// interrupt the wait immediately; a partial interval is not reported.
    pub async fn run<F>(&self, stop: F) -> MonitorSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        debug!(interval_ms = self.interval.as_millis() as u64, "Monitoring started");

        let exit = loop {
            if self.shutdown.is_shutdown_requested() {
                break MonitorExit::Shutdown;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break MonitorExit::Shutdown,
                _ = &mut stop => break MonitorExit::Stopped,
                _ = ticker.tick() => {
                    let record = self.sample();
                    ticks += 1;
                    self.emit(&record);
                }
            }
        };

        debug!(?exit, ticks, "Monitoring ended");
        MonitorSummary { exit, ticks }
    }
}
