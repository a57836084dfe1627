//! Shared counters and flags observed across the callback and controlling tasks.
//!
//! Every field is a lone atomic scalar. The receive callback is the only
//! writer of the per-interval counter and the anomaly flags; the monitoring
//! loop is the only task that resets them. No field needs a lock.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// ============================================================================
// Sticky Flag
// ============================================================================

/// Boolean that stays raised until a reader explicitly takes it.
///
/// Several raises between two takes collapse into one observation.
#[derive(Debug, Default)]
pub struct StickyFlag(AtomicBool);

impl StickyFlag {
    /// Create a lowered flag
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Raise the flag if it is not already raised.
    ///
    /// Returns `true` only for the raise that changed the flag.
    pub fn raise(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Read and lower the flag in one step
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Check the flag without lowering it
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Consumer Statistics
// ============================================================================

/// Counters and anomaly flags for one consumption pipeline
#[derive(Debug, Default)]
pub struct ConsumerStats {
    messages_this_interval: AtomicU64,
    redelivery_detected: StickyFlag,
    discard_detected: StickyFlag,
    total_received: AtomicU64,
    total_acknowledged: AtomicU64,
    total_processing_failures: AtomicU64,
}

impl ConsumerStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one received message
    pub fn record_received(&self) {
        self.messages_this_interval.fetch_add(1, Ordering::Relaxed);
        self.total_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one acknowledgment handed to the transport
    pub fn record_acknowledged(&self) {
        self.total_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one message whose processing failed
    pub fn record_processing_failure(&self) {
        self.total_processing_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the messages received since the last call and reset the count
    pub fn take_interval_count(&self) -> u64 {
        self.messages_this_interval.swap(0, Ordering::AcqRel)
    }

    /// Messages received in the current, not yet reported, interval
    pub fn interval_count(&self) -> u64 {
        self.messages_this_interval.load(Ordering::Relaxed)
    }

    /// Sticky flag raised when a redelivered message arrives
    pub fn redelivery(&self) -> &StickyFlag {
        &self.redelivery_detected
    }

    /// Sticky flag raised when the broker signals discarded messages
    pub fn discard(&self) -> &StickyFlag {
        &self.discard_detected
    }

    /// Messages received since start
    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    /// Acknowledgments handed to the transport since start
    pub fn total_acknowledged(&self) -> u64 {
        self.total_acknowledged.load(Ordering::Relaxed)
    }

    /// Messages whose processing failed since start
    pub fn total_processing_failures(&self) -> u64 {
        self.total_processing_failures.load(Ordering::Relaxed)
    }

    /// Lifetime totals, never reset
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_received: self.total_received(),
            total_acknowledged: self.total_acknowledged(),
            total_processing_failures: self.total_processing_failures(),
        }
    }
}

/// Point-in-time copy of the lifetime totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_received: u64,
    pub total_acknowledged: u64,
    pub total_processing_failures: u64,
}

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;
