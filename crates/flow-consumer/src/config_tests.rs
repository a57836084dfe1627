//! Tests for consumer configuration.

use super::*;
use std::collections::HashMap;
use std::io::Write;

fn no_environment() -> config::Environment {
    ConsumerConfig::environment().source(Some(HashMap::new()))
}

fn environment(vars: &[(&str, &str)]) -> config::Environment {
    let map = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    ConsumerConfig::environment().source(Some(map))
}

fn write_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults_match_sample_setup() {
    let config = ConsumerConfig::default();

    assert_eq!(config.session.host, "localhost:55555");
    assert_eq!(config.session.reconnect_retries, 20);
    assert_eq!(config.session.connect_retries_per_host, 5);
    assert_eq!(config.queue.name, "q_pers_sub");
    assert_eq!(config.queue.ack_mode, AckMode::Client);
    assert!(config.queue.active_flow_indication);
    assert_eq!(
        config.direct.subscriptions,
        vec!["samples/direct/>", "samples/control/>"]
    );
    assert_eq!(config.interval(), Duration::from_secs(1));
    assert_eq!(config.grace_period(), Duration::from_secs(1));
    assert_eq!(config.shutdown.quit_suffix, "control/quit");
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_sources_yield_defaults() {
    let config = ConsumerConfig::load_from(None, no_environment()).unwrap();

    assert_eq!(config, ConsumerConfig::default());
}

#[test]
fn test_loads_partial_toml_file() {
    // Arrange
    let file = write_file(
        ".toml",
        r#"
[queue]
name = "orders"
ack_mode = "auto"

[monitor]
interval_ms = 250
"#,
    );

    // Act
    let config = ConsumerConfig::load_from(Some(file.path()), no_environment()).unwrap();

    // Assert
    assert_eq!(config.queue.name, "orders");
    assert_eq!(config.queue.ack_mode, AckMode::Auto);
    assert_eq!(config.interval(), Duration::from_millis(250));
    assert_eq!(config.session, SessionProperties::default());
}

#[test]
fn test_environment_overrides_file() {
    // Arrange
    let file = write_file(".toml", "[queue]\nname = \"orders\"\n");
    let env = environment(&[
        ("FC__QUEUE__NAME", "invoices"),
        ("FC__SHUTDOWN__GRACE_PERIOD_MS", "50"),
        ("FC__DIRECT__SUBSCRIPTIONS", "a/b/>,a/c/*"),
    ]);

    // Act
    let config = ConsumerConfig::load_from(Some(file.path()), env).unwrap();

    // Assert
    assert_eq!(config.queue.name, "invoices");
    assert_eq!(config.grace_period(), Duration::from_millis(50));
    assert_eq!(config.direct.subscriptions, vec!["a/b/>", "a/c/*"]);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let result = ConsumerConfig::load_from(
        Some(Path::new("/nonexistent/flow-consumer.toml")),
        no_environment(),
    );

    assert!(matches!(result, Err(ConfigurationError::Missing { .. })));
}

#[test]
fn test_malformed_file_is_a_parsing_error() {
    let file = write_file(".toml", "[monitor]\ninterval_ms = \"soon\"\n");

    let result = ConsumerConfig::load_from(Some(file.path()), no_environment());

    assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
}

#[test]
fn test_zero_interval_rejected() {
    let mut config = ConsumerConfig::default();
    config.monitor.interval_ms = 0;

    let result = config.validate();

    assert!(matches!(
        result,
        Err(ConfigurationError::Validation(ValidationError::OutOfRange { ref field, .. }))
            if field == "monitor.interval_ms"
    ));
}

#[test]
fn test_invalid_queue_name_rejected() {
    let mut config = ConsumerConfig::default();
    config.queue.name = "bad queue".to_string();

    assert!(config.validate().is_err());
    assert!(config.flow_config().is_err());
}

#[test]
fn test_empty_host_rejected() {
    let mut config = ConsumerConfig::default();
    config.session.host = "  ".to_string();

    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Validation(ValidationError::Required { .. }))
    ));
}

#[test]
fn test_invalid_subscription_rejected() {
    let mut config = ConsumerConfig::default();
    config.direct.subscriptions = vec!["a/>/b".to_string()];

    assert!(config.validate().is_err());
}

#[test]
fn test_flow_config_carries_queue_settings() {
    let mut config = ConsumerConfig::default();
    config.queue.ack_mode = AckMode::Auto;
    config.queue.active_flow_indication = false;

    let flow = config.flow_config().unwrap();

    assert_eq!(flow.queue.as_str(), "q_pers_sub");
    assert_eq!(flow.ack_mode, AckMode::Auto);
    assert!(!flow.active_flow_indication);
}

#[test]
fn test_debug_redacts_password() {
    let mut config = ConsumerConfig::default();
    config.session.password = Some("hunter2".to_string());

    let rendered = format!("{:?}", config);

    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("<redacted>"));
}
