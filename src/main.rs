//! phasecast - three-phase power metrology fan-out
//!
//! One binary, one role per process:
//!
//! ```bash
//! # Publisher: replay a recorded dataset at 60 Hz, forever
//! phasecast publish --dataset ./data/three_phase.csv
//!
//! # Publisher: relay a live front-end feed
//! phasecast publish --live-tcp 10.0.0.5:7000
//! front-end-bridge | phasecast publish --stdin
//!
//! # Consumers
//! phasecast timeseries --endpoint tcp://127.0.0.1:5557 --sink sled
//! phasecast summary --host 127.0.0.1 --port 5557
//!
//! # Wait for the publisher before starting consumers
//! phasecast probe --endpoint tcp://127.0.0.1:5557 --timeout-secs 30
//! ```
//!
//! # Environment Variables
//!
//! - `PHASECAST_CONFIG`: path to the TOML configuration file
//! - `PHASECAST_LOG_JSON`: emit JSON log lines
//! - `DATABASE_URL`: Postgres/TimescaleDB URL for `--sink timescale`
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use phasecast::acquisition::{
    Dataset, DatasetOptions, LiveFeedClient, LiveTcpSource, RecordSource, ReplaySource,
    StdinSource,
};
use phasecast::api::{create_app, ApiState};
use phasecast::backoff::Backoff;
use phasecast::config::{defaults, ConfigError, PhasecastConfig, SinkKind};
use phasecast::lifecycle::{self, Readiness, TaskName, TaskSet};
use phasecast::metrics::PipelineMetrics;
use phasecast::publisher::{Publisher, PublisherOptions, PublisherStatus};
use phasecast::reducers::{
    SummaryBoard, SummaryReducer, TimeSeriesReducer, TimeSeriesSnapshot,
};
use phasecast::storage::open_sink;
use phasecast::subscriber::{run_subscription, RecordReducer, Subscription, SubscriptionOptions};
use phasecast::wire::Endpoint;
use phasecast::RowLayout;

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 2;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "phasecast")]
#[command(about = "Three-phase power metrology fan-out")]
#[command(version)]
struct CliArgs {
    /// Configuration file (default: $PHASECAST_CONFIG, then ./phasecast.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true, env = "PHASECAST_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: SubCommand,
}

/// Fan-out endpoint, as `tcp://host:port` or as a host and port pair.
#[derive(clap::Args, Debug, Clone, Default)]
struct EndpointArgs {
    /// Full endpoint, e.g. tcp://127.0.0.1:5557 (wins over --host/--port)
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

impl EndpointArgs {
    fn is_set(&self) -> bool {
        self.endpoint.is_some() || self.host.is_some() || self.port.is_some()
    }

    /// Resolve against the configured endpoint; a lone --host or --port
    /// replaces only that half.
    fn resolve(&self, configured: &str) -> Result<Endpoint, ConfigError> {
        let invalid =
            |e: phasecast::wire::EndpointError| ConfigError::Validation(vec![e.to_string()]);
        if !self.is_set() {
            return Endpoint::parse(configured).map_err(invalid);
        }
        if let Some(endpoint) = &self.endpoint {
            return Endpoint::parse(endpoint).map_err(invalid);
        }
        let base = Endpoint::parse(configured).map_err(invalid)?;
        let host = self.host.clone().unwrap_or_else(|| base.host().to_string());
        let port = self.port.unwrap_or(base.port());
        Endpoint::resolve(None, Some(&host), Some(port)).map_err(invalid)
    }
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Bind the fan-out endpoint and publish records
    Publish {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Recorded CSV dataset to replay in a loop
        #[arg(long, value_name = "PATH")]
        dataset: Option<PathBuf>,

        /// Relay a live JSON-lines feed from HOST:PORT
        #[arg(long, value_name = "HOST:PORT", conflicts_with = "dataset")]
        live_tcp: Option<String>,

        /// Relay JSON lines from stdin
        #[arg(long, conflicts_with_all = ["dataset", "live_tcp"])]
        stdin: bool,

        /// Replay rate in frames per second
        #[arg(long)]
        rate_hz: Option<f64>,

        /// Seconds to wait for subscribers before emitting
        #[arg(long)]
        grace_secs: Option<u64>,

        #[arg(long)]
        topic: Option<String>,

        /// HTTP address for /metrics, /health and /ready
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Subscribe and write time-series rows to a sink
    Timeseries {
        #[command(flatten)]
        endpoint: EndpointArgs,

        #[arg(long)]
        topic: Option<String>,

        /// sled, timescale or memory
        #[arg(long)]
        sink: Option<SinkKind>,

        /// sled database directory
        #[arg(long, value_name = "PATH")]
        path: Option<String>,

        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: Option<String>,

        /// per_phase or aggregate
        #[arg(long)]
        layout: Option<RowLayout>,

        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Subscribe and publish per-device window summaries
    Summary {
        #[command(flatten)]
        endpoint: EndpointArgs,

        #[arg(long)]
        topic: Option<String>,

        /// Tumbling window length in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,

        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Exit 0 once a publisher accepts a subscription
    Probe {
        #[command(flatten)]
        endpoint: EndpointArgs,

        #[arg(long)]
        topic: Option<String>,

        #[arg(long, default_value_t = defaults::PROBE_TIMEOUT_SECS)]
        timeout_secs: u64,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

// ============================================================================
// Configuration
// ============================================================================

/// Fold CLI overrides into the loaded configuration.
fn apply_overrides(config: &mut PhasecastConfig, command: &SubCommand) -> Result<(), ConfigError> {
    match command {
        SubCommand::Publish {
            endpoint,
            dataset,
            rate_hz,
            grace_secs,
            topic,
            addr,
            ..
        } => {
            if endpoint.is_set() {
                config.publisher.endpoint =
                    endpoint.resolve(&config.publisher.endpoint)?.to_string();
            }
            if let Some(path) = dataset {
                config.publisher.dataset = Some(path.display().to_string());
            }
            if let Some(rate) = rate_hz {
                config.publisher.rate_hz = *rate;
            }
            if let Some(secs) = grace_secs {
                config.publisher.grace_period_secs = *secs;
            }
            if let Some(topic) = topic {
                config.publisher.topic = topic.clone();
            }
            if let Some(addr) = addr {
                config.server.publish_addr = addr.clone();
            }
        }
        SubCommand::Timeseries {
            endpoint,
            topic,
            sink,
            path,
            database_url,
            layout,
            addr,
        } => {
            apply_subscriber_overrides(config, endpoint, topic.as_deref())?;
            if let Some(kind) = sink {
                config.storage.kind = *kind;
            }
            if let Some(path) = path {
                config.storage.path = path.clone();
            }
            if let Some(url) = database_url {
                config.storage.url = Some(url.clone());
            }
            if let Some(layout) = layout {
                config.timeseries.layout = *layout;
            }
            if let Some(addr) = addr {
                config.server.timeseries_addr = addr.clone();
            }
        }
        SubCommand::Summary {
            endpoint,
            topic,
            window_ms,
            addr,
        } => {
            apply_subscriber_overrides(config, endpoint, topic.as_deref())?;
            if let Some(ms) = window_ms {
                config.summary.window_ms = *ms;
            }
            if let Some(addr) = addr {
                config.server.summary_addr = addr.clone();
            }
        }
        SubCommand::Probe { endpoint, topic, .. } => {
            apply_subscriber_overrides(config, endpoint, topic.as_deref())?;
        }
        SubCommand::ShowConfig => {}
    }
    Ok(())
}

fn apply_subscriber_overrides(
    config: &mut PhasecastConfig,
    endpoint: &EndpointArgs,
    topic: Option<&str>,
) -> Result<(), ConfigError> {
    if endpoint.is_set() {
        config.subscriber.endpoint = endpoint.resolve(&config.subscriber.endpoint)?.to_string();
    }
    if let Some(topic) = topic {
        config.subscriber.topic = topic.to_string();
    }
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Publish
// ============================================================================

#[derive(Debug)]
enum Input {
    Dataset(PathBuf),
    LiveTcp(String),
    Stdin,
}

/// Input for `publish`; `None` for every other subcommand. Publishing with
/// no input at all is a configuration error.
fn select_input(
    command: &SubCommand,
    config: &PhasecastConfig,
) -> Result<Option<Input>, ConfigError> {
    let SubCommand::Publish { live_tcp, stdin, .. } = command else {
        return Ok(None);
    };
    if let Some(addr) = live_tcp {
        return Ok(Some(Input::LiveTcp(addr.clone())));
    }
    if *stdin {
        return Ok(Some(Input::Stdin));
    }
    match &config.publisher.dataset {
        Some(path) => Ok(Some(Input::Dataset(PathBuf::from(path)))),
        None => Err(ConfigError::Validation(vec![
            "no input: pass --dataset, --live-tcp or --stdin (or set publisher.dataset)"
                .to_string(),
        ])),
    }
}

fn register_publisher_metrics(metrics: &PipelineMetrics, status: &PublisherStatus) -> Result<()> {
    use std::sync::atomic::Ordering::Relaxed;

    let s = status.clone();
    metrics.counter_fn(
        "records_published_total",
        "Records handed to the fan-out hub",
        move || s.records_published(),
    )?;
    let s = status.clone();
    metrics.counter_fn(
        "records_unheard_total",
        "Records published with no subscriber attached",
        move || s.unheard(),
    )?;
    let s = status.clone();
    metrics.counter_fn(
        "encode_errors_total",
        "Records that could not be encoded",
        move || s.encode_errors(),
    )?;
    let s = status.clone();
    metrics.counter_fn(
        "sessions_accepted_total",
        "Subscriber connections accepted",
        move || s.stats().sessions_accepted.load(Relaxed),
    )?;
    let s = status.clone();
    metrics.counter_fn(
        "sessions_rejected_total",
        "Subscriptions rejected for topic mismatch",
        move || s.stats().sessions_rejected.load(Relaxed),
    )?;
    let s = status.clone();
    metrics.counter_fn(
        "records_lagged_total",
        "Records dropped for slow subscribers",
        move || s.stats().records_lagged.load(Relaxed),
    )?;
    let s = status.clone();
    metrics.gauge_fn("subscribers", "Attached subscribers", move || s.stats().active())?;
    let s = status.clone();
    metrics.gauge_fn("emitting", "1 once the grace period is over", move || {
        u64::from(s.is_emitting())
    })?;
    Ok(())
}

fn spawn_pump<S: RecordSource>(
    tasks: &mut TaskSet,
    publisher: Publisher,
    source: S,
    cancel: CancellationToken,
) {
    tasks.spawn(async move {
        let published = publisher.run(source, cancel).await?;
        info!("[PublisherPump] {} records published", published);
        Ok(TaskName::PublisherPump)
    });
}

fn drain_timeout() -> Duration {
    Duration::from_secs(defaults::SHUTDOWN_DRAIN_SECS)
}

async fn run_publish(
    config: &PhasecastConfig,
    input: Input,
    cancel: CancellationToken,
) -> Result<()> {
    let options = PublisherOptions::from_config(&config.publisher)?;
    let publisher = Publisher::bind(options)
        .await
        .context("cannot bind the fan-out endpoint")?;
    let status = publisher.status();

    let readiness = Readiness::new();
    readiness.set_ready(true);
    let metrics = Arc::new(PipelineMetrics::new("publish")?);
    register_publisher_metrics(&metrics, &status)?;

    let mut tasks = TaskSet::new();
    let listener = lifecycle::bind_http(&config.server.publish_addr).await?;
    let app = create_app(ApiState::new("publish", metrics, readiness).with_publisher(status));
    lifecycle::spawn_http_server(&mut tasks, listener, app, cancel.clone());

    match input {
        Input::Dataset(path) => {
            let options = DatasetOptions {
                fill_missing_phases: config.publisher.fill_missing_phases,
                nominal_frequency_hz: config.publisher.nominal_frequency_hz,
            };
            // CSV parsing is synchronous file I/O.
            let dataset = tokio::task::spawn_blocking(move || {
                Dataset::load_csv(&path, &options)
                    .with_context(|| format!("cannot load dataset {}", path.display()))
            })
            .await
            .context("dataset loader task failed")??;
            info!(
                "Input: dataset replay at {} Hz ({} frames, {} records)",
                config.publisher.rate_hz,
                dataset.frame_count(),
                dataset.record_count()
            );
            let source = ReplaySource::new(dataset, config.publisher.rate_hz);
            spawn_pump(&mut tasks, publisher, source, cancel.clone());
        }
        Input::LiveTcp(addr) => {
            info!("Input: live feed from {}", addr);
            let p = &config.publisher;
            let backoff = Backoff::new(
                Duration::from_millis(defaults::LIVE_RECONNECT_INITIAL_MS),
                Duration::from_millis(defaults::LIVE_RECONNECT_MAX_MS),
                0.0,
            );
            let client = LiveFeedClient::new(&addr)
                .with_connect_timeout(p.live_connect_timeout())
                .with_read_timeout(p.live_read_timeout())
                .with_reconnect(p.live_reconnect_attempts, backoff);
            let source = LiveTcpSource::from_client(client).await?;
            spawn_pump(&mut tasks, publisher, source, cancel.clone());
        }
        Input::Stdin => {
            info!("Input: JSON lines from stdin");
            spawn_pump(&mut tasks, publisher, StdinSource::new(), cancel.clone());
        }
    }

    lifecycle::run_supervisor(&mut tasks, cancel, drain_timeout()).await
}

// ============================================================================
// Consumers
// ============================================================================

fn register_subscription_metrics(
    metrics: &PipelineMetrics,
    subscription: &Subscription,
) -> Result<()> {
    let stats = subscription.stats();
    let s = Arc::clone(&stats);
    metrics.counter_fn(
        "records_received_total",
        "Records received from the publisher",
        move || s.records_received(),
    )?;
    let s = Arc::clone(&stats);
    metrics.counter_fn(
        "decode_errors_total",
        "Frames skipped as undecodable",
        move || s.decode_errors(),
    )?;
    let s = Arc::clone(&stats);
    metrics.counter_fn(
        "reconnects_total",
        "Reconnections to the publisher",
        move || s.reconnects(),
    )?;
    let s = stats;
    metrics.gauge_fn("subscriber_streaming", "1 while connected and streaming", move || {
        u64::from(s.state() == phasecast::subscriber::SubscriberState::Streaming)
    })?;
    Ok(())
}

fn register_timeseries_metrics(
    metrics: &PipelineMetrics,
    reducer: &Arc<TimeSeriesReducer>,
) -> Result<()> {
    let r = Arc::clone(reducer);
    metrics.gauge_fn("pending_rows", "Rows waiting for the next flush", move || {
        r.pending_rows() as u64
    })?;

    let counters: [(&str, &str, fn(&TimeSeriesSnapshot) -> u64); 6] = [
        ("rows_written_total", "Rows written to the sink", |s| s.rows_written),
        ("batches_written_total", "Batches written to the sink", |s| s.batches_written),
        ("sink_retries_total", "Sink write retries", |s| s.retries),
        (
            "batches_dropped_total",
            "Batches dropped after the retry budget",
            |s| s.batches_dropped,
        ),
        ("rows_dropped_total", "Rows lost with dropped batches", |s| s.rows_dropped),
        (
            "rows_overflow_total",
            "Rows dropped because the buffer was full",
            |s| s.overflow_dropped,
        ),
    ];
    for (name, help, field) in counters {
        let r = Arc::clone(reducer);
        metrics.counter_fn(name, help, move || field(&r.stats().snapshot()))?;
    }
    Ok(())
}

fn spawn_subscription<R: RecordReducer + 'static>(
    tasks: &mut TaskSet,
    mut subscription: Subscription,
    reducer: Arc<R>,
    cancel: CancellationToken,
) {
    tasks.spawn(async move {
        let delivered = run_subscription(&mut subscription, reducer.as_ref(), &cancel).await?;
        info!("[Subscription] {} records delivered", delivered);
        Ok(TaskName::Subscription)
    });
}

async fn run_timeseries(config: &PhasecastConfig, cancel: CancellationToken) -> Result<()> {
    let sink = open_sink(&config.storage)
        .await
        .context("cannot open the time-series sink")?;
    info!(sink = sink.name(), layout = ?config.timeseries.layout, "Time-series sink ready");
    let reducer = Arc::new(TimeSeriesReducer::new(&config.timeseries, sink));

    let readiness = Readiness::new();
    let options = SubscriptionOptions::from_config(&config.subscriber, "timeseries")?;
    let subscription = Subscription::new(options).with_readiness(readiness.clone());

    let metrics = Arc::new(PipelineMetrics::new("timeseries")?);
    register_subscription_metrics(&metrics, &subscription)?;
    register_timeseries_metrics(&metrics, &reducer)?;

    let mut tasks = TaskSet::new();
    let listener = lifecycle::bind_http(&config.server.timeseries_addr).await?;
    let app = create_app(ApiState::new("timeseries", metrics, readiness));
    lifecycle::spawn_http_server(&mut tasks, listener, app, cancel.clone());

    let flusher = Arc::clone(&reducer);
    let token = cancel.clone();
    tasks.spawn(async move {
        flusher.run_flush_loop(token).await;
        Ok(TaskName::FlushLoop)
    });
    spawn_subscription(&mut tasks, subscription, reducer, cancel.clone());

    lifecycle::run_supervisor(&mut tasks, cancel, drain_timeout()).await
}

async fn run_summary(config: &PhasecastConfig, cancel: CancellationToken) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new("summary")?);
    let board = Arc::new(SummaryBoard::new());
    let window = Duration::from_millis(config.summary.window_ms);
    let reducer = Arc::new(
        SummaryReducer::new(window, Arc::clone(&board)).with_gauges(metrics.summary_gauges()?),
    );

    let readiness = Readiness::new();
    let options = SubscriptionOptions::from_config(&config.subscriber, "summary")?;
    let subscription = Subscription::new(options).with_readiness(readiness.clone());
    register_subscription_metrics(&metrics, &subscription)?;
    let r = Arc::clone(&reducer);
    metrics.counter_fn("windows_closed_total", "Summary windows closed", move || {
        r.windows_closed()
    })?;
    let b = Arc::clone(&board);
    metrics.gauge_fn("summary_devices", "Devices with a published summary", move || {
        b.device_count() as u64
    })?;

    let mut tasks = TaskSet::new();
    let listener = lifecycle::bind_http(&config.server.summary_addr).await?;
    let app = create_app(ApiState::new("summary", metrics, readiness).with_board(board));
    lifecycle::spawn_http_server(&mut tasks, listener, app, cancel.clone());

    let windower = Arc::clone(&reducer);
    let token = cancel.clone();
    tasks.spawn(async move {
        windower.run_window_loop(token).await;
        Ok(TaskName::WindowLoop)
    });
    spawn_subscription(&mut tasks, subscription, reducer, cancel.clone());

    lifecycle::run_supervisor(&mut tasks, cancel, drain_timeout()).await
}

async fn run_probe(config: &PhasecastConfig, timeout_secs: u64) -> Result<()> {
    let endpoint = Endpoint::parse(&config.subscriber.endpoint)?;
    let timeout = Duration::from_secs(timeout_secs);
    let handshake = lifecycle::probe(&endpoint, &config.subscriber.topic, timeout)
        .await
        .with_context(|| format!("publisher at {endpoint} not ready"))?;
    info!(
        publisher_id = %handshake.publisher_id,
        emitting = handshake.emitting,
        "Publisher at {} is ready",
        endpoint
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let loaded = match &args.config {
        Some(path) => PhasecastConfig::load_from_file(path),
        None => PhasecastConfig::load(),
    };
    init_logging(args.log_json || loaded.as_ref().is_ok_and(|c| c.logging.json));

    let (config, input) = match loaded.and_then(|mut config| {
        apply_overrides(&mut config, &args.command)?;
        config.validate()?;
        let input = select_input(&args.command, &config)?;
        Ok((config, input))
    }) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let SubCommand::ShowConfig = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    lifecycle::spawn_shutdown_listener(cancel.clone());

    match (&args.command, input) {
        (SubCommand::Publish { .. }, Some(input)) => run_publish(&config, input, cancel).await?,
        (SubCommand::Timeseries { .. }, _) => run_timeseries(&config, cancel).await?,
        (SubCommand::Summary { .. }, _) => run_summary(&config, cancel).await?,
        (SubCommand::Probe { timeout_secs, .. }, _) => {
            run_probe(&config, *timeout_secs).await?;
        }
        (SubCommand::Publish { .. }, None) | (SubCommand::ShowConfig, _) => {}
    }

    info!("phasecast shutdown complete");
    Ok(())
}
