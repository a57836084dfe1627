//! Integration tests for the guaranteed-delivery pipeline
//!
//! These tests verify, against the in-memory broker:
//! - Binding failures surface operator remediation without side effects
//! - Every processed message is acknowledged exactly once
//! - Interval counts add up to the delivered total
//! - Redeliveries raise exactly one anomaly report
//! - Quit messages end the run

mod common;

use bytes::Bytes;
use common::{
    connect, count_calls, position_of, provisioned_broker, queue_name, wait_for_received,
    RejectFirstAttempt, QUEUE,
};
use flow_consumer::{
    AckMode, BrokerCall, FlowBindError, FlowConfig, GuaranteedProcessor, InMemoryBroker,
    MonitorExit, QueueSpec, RecordingObserver, Session, ShutdownReason, ShutdownState,
};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};

fn processor() -> GuaranteedProcessor {
    GuaranteedProcessor::new(FlowConfig::new(queue_name(QUEUE)))
        .with_grace_period(Duration::ZERO)
        .with_quit_suffix("control/quit")
}

// ============================================================================
// Binding
// ============================================================================

#[tokio::test]
async fn test_missing_queue_reports_remediation() {
    // Arrange
    let broker = InMemoryBroker::new();
    let session = connect(&broker).await;
    let processor = processor();

    // Act
    let result = processor.run(&session, std::future::pending()).await;

    // Assert
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        FlowBindError::QueueMissingOrUnauthorized { ref reason, .. } if reason == "Unknown Queue"
    ));
    assert!(error.remediation().unwrap().contains(QUEUE));
    assert_eq!(processor.shutdown().state(), ShutdownState::Running);
    assert!(!session.is_closed());
    assert_eq!(
        count_calls(&broker, |c| matches!(c, BrokerCall::FlowBound { .. })),
        0
    );
}

#[tokio::test]
async fn test_unauthorized_queue_reports_remediation() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.provision_queue(QueueSpec::new(queue_name(QUEUE)).deny_access());
    let session = connect(&broker).await;
    let processor = processor();

    // Act
    let result = processor.run(&session, std::future::pending()).await;

    // Assert
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        FlowBindError::QueueMissingOrUnauthorized { ref reason, .. } if reason == "Permission Not Allowed"
    ));
    assert!(error.remediation().unwrap().contains(QUEUE));
    assert_eq!(processor.shutdown().state(), ShutdownState::Running);
}

#[tokio::test]
async fn test_unsupported_ack_mode_is_fatal() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.provision_queue(QueueSpec::new(queue_name(QUEUE)).with_ack_modes(vec![AckMode::Auto]));
    let session = connect(&broker).await;
    let processor = processor();

    // Act
    let result = processor.run(&session, std::future::pending()).await;

    // Assert
    let error = result.unwrap_err();
    assert!(error.is_fatal());
    assert!(error.remediation().is_none());
    assert_eq!(processor.shutdown().state(), ShutdownState::Running);
}

// ============================================================================
// Delivery and Acknowledgment
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_thousand_messages_are_counted_and_acknowledged() {
    // Arrange
    let broker = provisioned_broker();
    let session = connect(&broker).await;
    let observer = Arc::new(RecordingObserver::new());
    let processor = processor().with_observer(observer.clone());
    let stats = processor.stats();
    let start = Instant::now();

    // Act
    let summary = processor
        .run(&session, async {
            for i in 0..600 {
                broker.publish_to_topic(&format!("samples/pers/{}", i), Bytes::from("payload"));
            }
            wait_for_received(&stats, 600).await;
            sleep_until(start + Duration::from_millis(1500)).await;

            for _ in 600..1000 {
                broker
                    .publish_to_queue(&queue_name(QUEUE), Bytes::from("payload"))
                    .unwrap();
            }
            wait_for_received(&stats, 1000).await;
            assert_eq!(broker.unacked_count(&queue_name(QUEUE)), 0);
            sleep_until(start + Duration::from_millis(2500)).await;
        })
        .await
        .unwrap();

    // Assert
    let records = observer.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].messages_per_interval, 600);
    assert_eq!(records[1].messages_per_interval, 400);
    assert!(records.iter().all(|r| !r.has_anomaly()));

    assert_eq!(summary.monitor.exit, MonitorExit::Stopped);
    assert_eq!(summary.totals.total_received, 1000);
    assert_eq!(summary.totals.total_acknowledged, 1000);
    assert_eq!(
        count_calls(&broker, |c| matches!(c, BrokerCall::Acknowledged { .. })),
        1000
    );
    assert_eq!(broker.queue_depth(&queue_name(QUEUE)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_raises_one_anomaly_report() {
    // Arrange
    let broker = provisioned_broker();
    let session = connect(&broker).await;
    let observer = Arc::new(RecordingObserver::new());
    let rejecting = Arc::new(RejectFirstAttempt::default());
    let processor = processor()
        .with_observer(observer.clone())
        .with_processor(rejecting.clone());
    let stats = processor.stats();
    let start = Instant::now();

    // Act
    let summary = processor
        .run(&session, async {
            broker.publish_to_topic("samples/pers/order", Bytes::from("order"));
            wait_for_received(&stats, 1).await;
            assert_eq!(broker.unacked_count(&queue_name(QUEUE)), 1);

            assert_eq!(broker.redeliver_unacked(&queue_name(QUEUE)), 1);
            wait_for_received(&stats, 2).await;
            assert_eq!(broker.unacked_count(&queue_name(QUEUE)), 0);

            sleep_until(start + Duration::from_millis(2500)).await;
        })
        .await
        .unwrap();

    // Assert
    let records = observer.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().filter(|r| r.redelivery_anomaly).count(), 1);
    assert!(records[0].redelivery_anomaly);
    assert_eq!(records[0].messages_per_interval, 2);

    let seen = rejecting.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);

    assert_eq!(summary.totals.total_received, 2);
    assert_eq!(summary.totals.total_acknowledged, 1);
    assert_eq!(summary.totals.total_processing_failures, 1);
}

#[tokio::test]
async fn test_unacknowledged_messages_return_to_queue_on_close() {
    // Arrange
    let broker = provisioned_broker();
    let session = connect(&broker).await;
    let processor = processor().with_processor(Arc::new(RejectFirstAttempt::default()));
    let stats = processor.stats();

    // Act
    processor
        .run(&session, async {
            broker.publish_to_topic("samples/pers/a", Bytes::from("a"));
            broker.publish_to_topic("samples/pers/b", Bytes::from("b"));
            wait_for_received(&stats, 2).await;
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(broker.queue_depth(&queue_name(QUEUE)), 2);
    assert_eq!(
        count_calls(&broker, |c| matches!(c, BrokerCall::Acknowledged { .. })),
        0
    );
}

// ============================================================================
// Shutdown Triggers
// ============================================================================

#[tokio::test]
async fn test_quit_message_ends_run_after_acknowledgment() {
    // Arrange
    let broker = provisioned_broker();
    let session = connect(&broker).await;
    let processor = processor();

    // Act
    let summary = processor
        .run(&session, async {
            broker.publish_to_topic("samples/pers/work", Bytes::from("work"));
            broker.publish_to_topic("samples/pers/control/quit", Bytes::new());
            std::future::pending::<()>().await
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(summary.monitor.exit, MonitorExit::Shutdown);
    assert_eq!(
        summary.reason,
        Some(ShutdownReason::QuitMessage {
            destination: "samples/pers/control/quit".to_string()
        })
    );
    assert_eq!(summary.totals.total_acknowledged, 2);
    assert_eq!(broker.queue_depth(&queue_name(QUEUE)), 0);
    assert_eq!(processor.shutdown().state(), ShutdownState::Closed);
}

#[tokio::test]
async fn test_transport_failure_stops_flow_before_closing_session() {
    // Arrange
    let broker = provisioned_broker();
    let session = connect(&broker).await;
    let processor = processor();
    let stats = processor.stats();

    // Act
    let summary = processor
        .run(&session, async {
            broker.publish_to_topic("samples/pers/1", Bytes::from("1"));
            wait_for_received(&stats, 1).await;
            broker.fail_transport("reconnect attempts exhausted");
            std::future::pending::<()>().await
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(summary.monitor.exit, MonitorExit::Shutdown);
    assert!(matches!(
        summary.reason,
        Some(ShutdownReason::TransportFatal { ref message }) if message.contains("exhausted")
    ));
    let stopped = |c: &BrokerCall| matches!(c, BrokerCall::FlowStopped { .. });
    let closed = |c: &BrokerCall| matches!(c, BrokerCall::SessionClosed { .. });
    assert_eq!(count_calls(&broker, stopped), 1);
    assert_eq!(count_calls(&broker, closed), 1);
    assert!(position_of(&broker, stopped) < position_of(&broker, closed));
    assert!(session.is_closed());
    assert_eq!(processor.shutdown().state(), ShutdownState::Closed);
}

#[tokio::test]
async fn test_transient_interruption_keeps_consuming() {
    // Arrange
    let broker = provisioned_broker();
    let session = connect(&broker).await;
    let processor = processor();
    let stats = processor.stats();

    // Act
    let summary = processor
        .run(&session, async {
            broker.publish_to_topic("samples/pers/1", Bytes::from("1"));
            wait_for_received(&stats, 1).await;
            broker.interrupt_transport();
            broker.publish_to_topic("samples/pers/2", Bytes::from("2"));
            wait_for_received(&stats, 2).await;
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(summary.monitor.exit, MonitorExit::Stopped);
    assert_eq!(summary.reason, Some(ShutdownReason::MonitorStopped));
    assert_eq!(summary.totals.total_acknowledged, 2);
}
