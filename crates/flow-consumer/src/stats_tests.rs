//! Tests for shared counters and sticky flags.

use super::*;
use std::sync::Arc;

mod sticky_flag {
    use super::*;

    #[test]
    fn test_starts_lowered() {
        let flag = StickyFlag::new();
        assert!(!flag.is_raised());
        assert!(!flag.take());
    }

    #[test]
    fn test_only_first_raise_reports_transition() {
        let flag = StickyFlag::new();

        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(!flag.raise());
        assert!(flag.is_raised());
    }

    #[test]
    fn test_take_reads_and_clears_once() {
        let flag = StickyFlag::new();
        flag.raise();
        flag.raise();

        assert!(flag.take());
        assert!(!flag.take());
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_raise_after_take_is_visible_again() {
        let flag = StickyFlag::new();
        flag.raise();
        assert!(flag.take());

        assert!(flag.raise());
        assert!(flag.take());
    }
}

mod consumer_stats {
    use super::*;

    #[test]
    fn test_interval_count_resets_but_totals_do_not() {
        let stats = ConsumerStats::new();
        for _ in 0..5 {
            stats.record_received();
        }

        assert_eq!(stats.interval_count(), 5);
        assert_eq!(stats.take_interval_count(), 5);
        assert_eq!(stats.take_interval_count(), 0);
        assert_eq!(stats.total_received(), 5);
    }

    #[test]
    fn test_snapshot_reports_lifetime_totals() {
        let stats = ConsumerStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_acknowledged();
        stats.record_processing_failure();
        stats.take_interval_count();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                total_received: 2,
                total_acknowledged: 1,
                total_processing_failures: 1,
            }
        );
    }

    #[test]
    fn test_anomaly_flags_are_independent() {
        let stats = ConsumerStats::new();
        stats.redelivery().raise();

        assert!(!stats.discard().is_raised());
        assert!(stats.redelivery().take());
    }

    #[test]
    fn test_counts_from_many_threads_are_not_lost() {
        let stats = Arc::new(ConsumerStats::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_received();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.take_interval_count(), 1000);
        assert_eq!(stats.total_received(), 1000);
    }

    #[test]
    fn test_totals_survive_interval_reset() {
        // Arrange
        let stats = ConsumerStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_acknowledged();
        stats.record_processing_failure();

        // Act
        stats.take_interval_count();

        // Assert
        assert_eq!(stats.total_received(), 2);
        assert_eq!(stats.total_acknowledged(), 1);
        assert_eq!(stats.total_processing_failures(), 1);
    }
}
