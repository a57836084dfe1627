//! # Flow Consumer CLI
//!
//! Command-line runner for the consumption pipelines.
//!
//! This module provides CLI commands for:
//! - Consuming a durable queue with client acknowledgment (`guaranteed`)
//! - Consuming direct topic subscriptions (`direct`)
//!
//! Both commands run against the in-memory broker. A synthetic publisher can
//! feed the broker so the monitoring output and anomaly reporting can be
//! observed without external infrastructure.

use clap::{Args, Parser, Subcommand};
use flow_consumer::{
    ConfigurationError, ConsumerConfig, DirectSubscriber, FlowBindError, GuaranteedProcessor,
    InMemoryBroker, InboundMessage, IntervalObserver, IntervalRecord, LoggingEventHandler,
    MessageProcessor, ProcessingError, QueueSpec, RunSummary, Session, SessionError,
    ShutdownCoordinator, ShutdownReason, TopicSubscription,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Topic subscription attracting published samples into the guaranteed queue
const PERSISTENT_TOPIC_SUBSCRIPTION: &str = "samples/pers/>";

// ============================================================================
// CLI Structure
// ============================================================================

/// Flow consumer - guaranteed and direct message consumption
#[derive(Parser)]
#[command(name = "flow-consumer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Consume broker messages with explicit acknowledgment and anomaly reporting")]
#[command(
    long_about = "Binds to a durable queue or to direct topic subscriptions, reports the \
                  message rate once per interval and shuts down cleanly on ENTER, Ctrl-C, a \
                  quit message or transport loss"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLOW_CONSUMER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Consume a durable queue with client acknowledgment
    Guaranteed {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Queue to bind to
        #[arg(short, long)]
        queue: Option<String>,

        /// Do not provision the queue on the broker before binding
        #[arg(long)]
        skip_provision: bool,

        /// Reject every Nth message so it is redelivered
        #[arg(long)]
        fail_every: Option<u64>,
    },

    /// Consume direct messages from topic subscriptions
    Direct {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Topic subscription, may be repeated
        #[arg(short, long = "subscription")]
        subscriptions: Vec<String>,

        /// Direct messages buffered before the broker discards
        #[arg(long)]
        egress_buffer: Option<usize>,
    },
}

/// Broker connection positionals
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Broker address, host[:port]
    pub host: String,

    /// Message VPN
    pub vpn: String,

    /// Client username
    pub username: String,

    /// Client password
    pub password: Option<String>,
}

/// Options shared by every pipeline
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Monitoring interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Wait between stopping delivery and closing the session, in milliseconds
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// Messages per second published by the synthetic publisher (0 disables it)
    #[arg(long, default_value = "0")]
    pub publish_rate: u32,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI error types
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Flow binding failed: {0}")]
    Bind(#[from] FlowBindError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for the error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::InvalidArgument { .. } | Self::Logging { .. } => 1,
            Self::Bind(FlowBindError::UnsupportedOperation { .. }) => 3,
            Self::Bind(FlowBindError::Session(_)) | Self::Session(_) => 4,
            Self::Bind(_) => 2,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;

    let config = load_configuration(&cli)?;

    match cli.command {
        Commands::Guaranteed {
            run,
            skip_provision,
            fail_every,
            ..
        } => execute_guaranteed_command(config, run, skip_provision, fail_every).await,
        Commands::Direct { run, .. } => execute_direct_command(config, run).await,
    }
}

/// Initialize logging based on CLI arguments.
///
/// `RUST_LOG` takes precedence over `--log-level`. Logs go to stderr so the
/// per-interval report on stdout stays readable.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let result = if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Load configuration from file and environment, then apply command-line
/// overrides
fn load_configuration(cli: &Cli) -> Result<ConsumerConfig, CliError> {
    let mut config = ConsumerConfig::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli.command);
    config.validate()?;

    debug!(config = ?config, "Configuration resolved");
    Ok(config)
}

fn apply_overrides(config: &mut ConsumerConfig, command: &Commands) {
    let (connection, run) = match command {
        Commands::Guaranteed {
            connection,
            run,
            queue,
            ..
        } => {
            if let Some(queue) = queue {
                config.queue.name = queue.clone();
            }
            (connection, run)
        }
        Commands::Direct {
            connection,
            run,
            subscriptions,
            egress_buffer,
        } => {
            if !subscriptions.is_empty() {
                config.direct.subscriptions = subscriptions.clone();
            }
            if let Some(egress_buffer) = egress_buffer {
                config.direct.egress_buffer = *egress_buffer;
            }
            (connection, run)
        }
    };

    config.session.host = connection.host.clone();
    config.session.vpn = connection.vpn.clone();
    config.session.username = connection.username.clone();
    if connection.password.is_some() {
        config.session.password = connection.password.clone();
    }
    if let Some(interval_ms) = run.interval_ms {
        config.monitor.interval_ms = interval_ms;
    }
    if let Some(grace_ms) = run.grace_ms {
        config.shutdown.grace_period_ms = grace_ms;
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Execute guaranteed command
async fn execute_guaranteed_command(
    config: ConsumerConfig,
    run: RunArgs,
    skip_provision: bool,
    fail_every: Option<u64>,
) -> Result<(), CliError> {
    let queue = config.queue_name().map_err(ConfigurationError::from)?;
    let broker = InMemoryBroker::new().with_egress_buffer(config.direct.egress_buffer);

    if skip_provision {
        warn!(queue = %queue, "Queue provisioning skipped");
    } else {
        let subscription = TopicSubscription::new(PERSISTENT_TOPIC_SUBSCRIPTION.to_string())
            .map_err(ConfigurationError::from)?;
        broker.provision_queue(QueueSpec::new(queue.clone()).with_subscription(subscription));
    }

    let session = broker
        .connect(&config.session, Arc::new(LoggingEventHandler))
        .await?;

    let mut processor = GuaranteedProcessor::from_config(&config)
        .map_err(ConfigurationError::from)?
        .with_observer(Arc::new(ConsoleObserver));
    if let Some(every) = fail_every {
        processor = processor.with_processor(Arc::new(RejectEvery::new(every)?));
    }

    let shutdown = processor.shutdown();
    let watchers = spawn_operator_watchers(&shutdown);
    let publisher = spawn_publisher(&shutdown, run.publish_rate, {
        let broker = broker.clone();
        let queue = queue.clone();
        move |sequence| {
            broker.publish_to_topic(
                &format!("samples/pers/{}", sequence),
                bytes::Bytes::from(format!("message {}", sequence)),
            );
            // Rejected messages come back as redeliveries on the next publish
            if fail_every.is_some() {
                broker.redeliver_unacked(&queue);
            }
        }
    });

    println!("Press [ENTER] to quit.");
    let result = processor.run(&session, std::future::pending()).await;
    stop_tasks(watchers, publisher);

    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(e) => {
            if let Some(remediation) = e.remediation() {
                println!("{}", remediation);
            }
            if let Err(close_error) = session_close(&session).await {
                warn!(error = %close_error, "Session close failed");
            }
            Err(e.into())
        }
    }
}

/// Execute direct command
async fn execute_direct_command(config: ConsumerConfig, run: RunArgs) -> Result<(), CliError> {
    let broker = InMemoryBroker::new().with_egress_buffer(config.direct.egress_buffer);
    let session = broker
        .connect(&config.session, Arc::new(LoggingEventHandler))
        .await?;

    let subscriber = DirectSubscriber::from_config(&config)
        .map_err(ConfigurationError::from)?
        .with_observer(Arc::new(ConsoleObserver));

    let shutdown = subscriber.shutdown();
    let watchers = spawn_operator_watchers(&shutdown);
    let publisher = spawn_publisher(&shutdown, run.publish_rate, {
        let broker = broker.clone();
        move |sequence| {
            broker.publish_to_topic(
                &format!("samples/direct/{}", sequence),
                bytes::Bytes::from(format!("message {}", sequence)),
            );
        }
    });

    println!("Press [ENTER] to quit.");
    let result = subscriber.run(&session, std::future::pending()).await;
    stop_tasks(watchers, publisher);

    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(e) => {
            if let Err(close_error) = session_close(&session).await {
                warn!(error = %close_error, "Session close failed");
            }
            Err(e.into())
        }
    }
}

async fn session_close(session: &dyn Session) -> Result<(), SessionError> {
    if session.is_closed() {
        return Ok(());
    }
    session.close().await
}

fn print_summary(summary: &RunSummary) {
    let reason = summary
        .reason
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "Shut down after {}: received {}, acknowledged {}, failed {}",
        reason,
        summary.totals.total_received,
        summary.totals.total_acknowledged,
        summary.totals.total_processing_failures
    );
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Request shutdown on ENTER, end of input, or a termination signal
fn spawn_operator_watchers(shutdown: &Arc<ShutdownCoordinator>) -> Vec<JoinHandle<()>> {
    let stdin_shutdown = Arc::clone(shutdown);
    let stdin_watcher = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(_)) => debug!("Operator pressed ENTER"),
            Ok(None) => debug!("Operator input closed"),
            Err(e) => warn!(error = %e, "Failed to read operator input"),
        }
        stdin_shutdown.request_shutdown(ShutdownReason::OperatorInput);
    });

    let signal_shutdown = Arc::clone(shutdown);
    let signal_watcher = tokio::spawn(async move {
        let gate = signal_shutdown.child_token();
        tokio::select! {
            _ = gate.cancelled() => {}
            _ = termination_signal() => {
                signal_shutdown.request_shutdown(ShutdownReason::Signal);
            }
        }
    });

    vec![stdin_watcher, signal_watcher]
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
///
/// A handler that cannot be installed never resolves.
async fn termination_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
            Err(e) => {
                warn!(error = %e, "Failed to install Ctrl+C signal handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Publish `rate` messages per second until shutdown
fn spawn_publisher<P>(
    shutdown: &Arc<ShutdownCoordinator>,
    rate: u32,
    publish: P,
) -> Option<JoinHandle<()>>
where
    P: Fn(u64) + Send + 'static,
{
    if rate == 0 {
        return None;
    }

    let gate = shutdown.child_token();
    let period = Duration::from_secs(1) / rate;
    info!(rate, "Starting synthetic publisher");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = gate.cancelled() => break,
                _ = ticker.tick() => {
                    sequence += 1;
                    publish(sequence);
                }
            }
        }
        debug!(published = sequence, "Synthetic publisher stopped");
    }))
}

fn stop_tasks(watchers: Vec<JoinHandle<()>>, publisher: Option<JoinHandle<()>>) {
    for task in watchers.into_iter().chain(publisher) {
        task.abort();
    }
}

// ============================================================================
// Observers and Processors
// ============================================================================

/// Prints the message rate of each interval, and any anomaly, to stdout
struct ConsoleObserver;

impl ConsoleObserver {
    fn lines(record: &IntervalRecord) -> Vec<String> {
        let mut lines = vec![format!("Received msgs/s: {}", record.messages_per_interval)];
        if record.redelivery_anomaly {
            lines.push("*** Redelivery detected ***".to_string());
        }
        if record.discard_anomaly {
            lines.push("*** Egress discard detected ***".to_string());
        }
        lines
    }
}

impl IntervalObserver for ConsoleObserver {
    fn on_interval(&self, record: &IntervalRecord) {
        for line in Self::lines(record) {
            println!("{}", line);
        }
    }
}

/// Rejects every Nth message
struct RejectEvery {
    every: u64,
    seen: AtomicU64,
}

impl RejectEvery {
    fn new(every: u64) -> Result<Self, CliError> {
        if every == 0 {
            return Err(CliError::InvalidArgument {
                arg: "fail-every".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            every,
            seen: AtomicU64::new(0),
        })
    }
}

impl MessageProcessor for RejectEvery {
    fn process(&self, message: &InboundMessage) -> Result<(), ProcessingError> {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % self.every == 0 {
            return Err(ProcessingError::Rejected {
                message_id: message.message_id.to_string(),
                reason: format!("every {}th message is rejected", self.every),
            });
        }
        Ok(())
    }
}
