//! Consumer configuration.
//!
//! Every field carries a default, so an empty configuration source yields a
//! runnable consumer bound to `q_pers_sub` on a local broker. Sources are
//! layered with the `config` crate: an optional file, then environment
//! variables prefixed `FC` with `__` as the nesting separator
//! (`FC__QUEUE__NAME=orders` sets `queue.name`).

use crate::error::{ConfigurationError, ValidationError};
use crate::flow::{AckMode, FlowConfig};
use crate::message::{QueueName, TopicSubscription};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "FC";

/// Top-level consumer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub session: SessionProperties,
    pub queue: QueueSettings,
    pub direct: DirectSettings,
    pub monitor: MonitorSettings,
    pub shutdown: ShutdownSettings,
}

/// Connection properties handed to the broker client
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProperties {
    /// Broker address, `host[:port]`
    pub host: String,
    /// Message VPN to join
    pub vpn: String,
    pub username: String,
    pub password: Option<String>,
    /// Reconnect attempts after an established connection drops
    pub reconnect_retries: u32,
    /// Connection attempts per host before moving to the next one
    pub connect_retries_per_host: u32,
}

impl Default for SessionProperties {
    fn default() -> Self {
        Self {
            host: "localhost:55555".to_string(),
            vpn: "default".to_string(),
            username: "default".to_string(),
            password: None,
            reconnect_retries: 20,
            connect_retries_per_host: 5,
        }
    }
}

impl fmt::Debug for SessionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProperties")
            .field("host", &self.host)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("reconnect_retries", &self.reconnect_retries)
            .field("connect_retries_per_host", &self.connect_retries_per_host)
            .finish()
    }
}

/// Guaranteed-delivery queue binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub ack_mode: AckMode,
    pub active_flow_indication: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "q_pers_sub".to_string(),
            ack_mode: AckMode::Client,
            active_flow_indication: true,
        }
    }
}

/// Direct (non-guaranteed) subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectSettings {
    pub subscriptions: Vec<String>,
    /// Messages the broker buffers for this consumer before discarding
    pub egress_buffer: usize,
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            subscriptions: vec![
                "samples/direct/>".to_string(),
                "samples/control/>".to_string(),
            ],
            egress_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Wait between stopping delivery and closing the session
    pub grace_period_ms: u64,
    /// Destination suffix that marks a message as a quit request
    pub quit_suffix: String,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 1000,
            quit_suffix: "control/quit".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Load configuration from an optional file and the environment.
    ///
    /// A missing explicit file is an error; absent environment variables are
    /// not.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_from(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("direct.subscriptions")
    }

    fn load_from(
        path: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigurationError::Missing {
                    key: path.display().to_string(),
                });
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(environment)
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: ConsumerConfig =
            settings
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })?;

        config.validate()?;
        Ok(config)
    }

    /// Check every field that has a constrained range or format
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.session.host.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "session.host".to_string(),
            }
            .into());
        }

        if self.session.vpn.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "session.vpn".to_string(),
            }
            .into());
        }

        self.queue_name()?;
        self.topic_subscriptions()?;

        if self.direct.egress_buffer == 0 {
            return Err(ValidationError::OutOfRange {
                field: "direct.egress_buffer".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }

        if self.monitor.interval_ms == 0 {
            return Err(ValidationError::OutOfRange {
                field: "monitor.interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }

        if self.shutdown.quit_suffix.is_empty() {
            return Err(ValidationError::Required {
                field: "shutdown.quit_suffix".to_string(),
            }
            .into());
        }

        Ok(())
    }

    pub fn queue_name(&self) -> Result<QueueName, ValidationError> {
        QueueName::new(self.queue.name.clone())
    }

    /// Flow binding built from the queue settings
    pub fn flow_config(&self) -> Result<FlowConfig, ValidationError> {
        Ok(FlowConfig::new(self.queue_name()?)
            .with_ack_mode(self.queue.ack_mode)
            .with_active_flow_indication(self.queue.active_flow_indication))
    }

    pub fn topic_subscriptions(&self) -> Result<Vec<TopicSubscription>, ValidationError> {
        self.direct
            .subscriptions
            .iter()
            .map(|s| TopicSubscription::new(s.clone()))
            .collect()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }
}
