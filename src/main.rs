#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use co2_recorder::config::{Config, OnDestinationError};
use co2_recorder::destination::{Destination, MemoryDestination, SheetsConfig, SheetsDestination};
use co2_recorder::feed::{FeedPublisher, FeedSubscriber};
use co2_recorder::observability::init_tracing;
use co2_recorder::sensor::SensorPoller;
use co2_recorder::source::{inbound_channel, ReadingSource};
use co2_recorder::{sniffer, RecorderLoop};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// CO2 sensor sniffer and spreadsheet recorder.
#[derive(Parser)]
#[command(name = "co2-recorder", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging filter when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log one JSON object per line.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the sensor and publish every reading to the broker.
    Sniff(SniffArgs),
    /// Aggregate readings per stream and append summary rows to the spreadsheet.
    Record(RecordArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct SensorArgs {
    /// Serial device path or tcp://host:port of a serial bridge.
    #[arg(long = "serial-port")]
    transport: Option<String>,

    #[arg(long)]
    baud_rate: Option<u32>,

    /// Seconds between sensor reads.
    #[arg(long)]
    sample_interval: Option<u64>,
}

#[derive(Args)]
struct SniffArgs {
    #[command(flatten)]
    sensor: SensorArgs,

    /// Broker URL, e.g. tcp://localhost:1883.
    #[arg(long)]
    mqtt_broker: Option<String>,

    /// Topic the readings are published on.
    #[arg(long)]
    mqtt_topic: Option<String>,

    /// Echo every reading to stdout.
    #[arg(long)]
    stdout: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Subscribe to the broker.
    Feed,
    /// Poll the sensor directly.
    Sensor,
}

#[derive(Args)]
struct RecordArgs {
    #[arg(long, value_enum, default_value = "feed")]
    source: SourceKind,

    #[command(flatten)]
    sensor: SensorArgs,

    #[arg(long)]
    mqtt_broker: Option<String>,

    /// Topic filter to subscribe to, or stream id of the polled sensor.
    #[arg(long)]
    mqtt_topic: Option<String>,

    #[arg(long)]
    spreadsheet_id: Option<String>,

    /// Prefix of the per-stream sheet names.
    #[arg(long)]
    sheet_prefix: Option<String>,

    /// Bearer token for the spreadsheet API; CO2_SHEETS_TOKEN works too.
    #[arg(long)]
    access_token: Option<String>,

    #[arg(long)]
    access_token_file: Option<PathBuf>,

    /// Seconds between flushes.
    #[arg(long)]
    record_interval: Option<u64>,

    /// Row to start writing at for new streams.
    #[arg(long)]
    initial_row: Option<u32>,

    #[arg(long, value_enum)]
    on_destination_error: Option<OnDestinationError>,

    /// With `--source sensor`, also publish every reading to the broker.
    #[arg(long)]
    republish: bool,

    /// Echo every accepted reading to stdout.
    #[arg(long)]
    stdout: bool,

    /// Log rows instead of writing them to the spreadsheet.
    #[arg(long)]
    dry_run: bool,
}

impl SensorArgs {
    fn apply(self, cfg: &mut Config) {
        if let Some(transport) = self.transport {
            cfg.sensor.transport = transport;
        }
        if let Some(baud_rate) = self.baud_rate {
            cfg.sensor.baud_rate = baud_rate;
        }
        if let Some(secs) = self.sample_interval {
            cfg.sensor.sample_interval = Duration::from_secs(secs);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("co2-recorder {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing(&cli.log_level, cli.log_json)
        .with_context(|| format!("initializing logging at level {}", cli.log_level))?;

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Sniff(args) => {
            args.sensor.apply(&mut cfg);
            if let Some(broker) = args.mqtt_broker {
                cfg.feed.broker = broker;
            }
            if let Some(topic) = args.mqtt_topic {
                cfg.sensor.stream_id = topic;
            }
            cfg.sensor.stdout |= args.stdout;
            cfg.validate().context("invalid configuration")?;

            rt.block_on(sniff(cfg))
        }
        Command::Record(args) => {
            let source = args.source;
            let dry_run = args.dry_run;
            apply_record_args(args, &mut cfg);
            cfg.validate().context("invalid configuration")?;

            rt.block_on(record(cfg, source, dry_run))
        }
        Command::Version => Ok(()),
    }
}

fn apply_record_args(args: RecordArgs, cfg: &mut Config) {
    let source = args.source;
    args.sensor.apply(cfg);
    if let Some(broker) = args.mqtt_broker {
        cfg.feed.broker = broker;
    }
    if let Some(topic) = args.mqtt_topic {
        match source {
            SourceKind::Feed => cfg.feed.topic = topic,
            SourceKind::Sensor => cfg.sensor.stream_id = topic,
        }
    }
    if let Some(id) = args.spreadsheet_id {
        cfg.destination.spreadsheet_id = id;
    }
    if let Some(prefix) = args.sheet_prefix {
        cfg.recorder.sheet_prefix = prefix;
    }
    if args.access_token.is_some() {
        cfg.destination.access_token = args.access_token;
    }
    if args.access_token_file.is_some() {
        cfg.destination.access_token_file = args.access_token_file;
    }
    if let Some(secs) = args.record_interval {
        cfg.recorder.flush_interval = Duration::from_secs(secs);
    }
    if args.initial_row.is_some() {
        cfg.recorder.initial_row = args.initial_row;
    }
    if let Some(policy) = args.on_destination_error {
        cfg.recorder.on_destination_error = policy;
    }
    cfg.recorder.stdout |= args.stdout;
    cfg.recorder.republish |= args.republish;
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = token.cancelled() => return,
        }

        #[cfg(not(unix))]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = token.cancelled() => return,
        }

        token.cancel();
    });
    Ok(())
}

async fn sniff(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sensor = %cfg.sensor.transport,
        broker = %cfg.feed.broker,
        topic = %cfg.sensor.stream_id,
        "starting sniffer"
    );

    sniffer::run(&cfg, shutdown).await.context("sniffer failed")?;
    Ok(())
}

async fn record(cfg: Config, source_kind: SourceKind, dry_run: bool) -> Result<()> {
    let destination: Arc<dyn Destination> = if dry_run {
        Arc::new(MemoryDestination::new())
    } else {
        cfg.validate_destination().context("invalid configuration")?;
        let token = cfg.destination.resolve_token().context("resolving spreadsheet token")?;
        Arc::new(
            SheetsDestination::new(SheetsConfig {
                endpoint: cfg.destination.endpoint.clone(),
                spreadsheet_id: cfg.destination.spreadsheet_id.clone(),
                access_token: token,
                request_timeout: cfg.destination.request_timeout,
            })
            .context("building spreadsheet client")?,
        )
    };

    let source = match source_kind {
        SourceKind::Feed => {
            ReadingSource::Feed(FeedSubscriber::new(&cfg.feed).context("configuring feed")?)
        }
        SourceKind::Sensor => ReadingSource::Sensor(SensorPoller::new(&cfg.sensor)),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %source.name(),
        destination = %destination.name(),
        "starting recorder"
    );

    let capacity = cfg.recorder.channel_capacity;
    let (tx, rx) = inbound_channel(capacity);
    let (producer, relay) = if cfg.recorder.republish && source_kind == SourceKind::Sensor {
        let publisher =
            FeedPublisher::connect(&cfg.feed, shutdown.clone()).context("configuring feed")?;
        let (sensor_tx, sensor_rx) = inbound_channel(capacity);
        let relay_shutdown = shutdown.clone();
        let relay = tokio::spawn(async move {
            let published = sniffer::relay(sensor_rx, &publisher, tx, &relay_shutdown).await;
            publisher.close().await;
            published
        });
        (source.spawn(sensor_tx, shutdown.clone()), Some(relay))
    } else {
        (source.spawn(tx, shutdown.clone()), None)
    };
    let recorder = RecorderLoop::new(&cfg.recorder, destination);

    let outcome = recorder.run(rx, shutdown.clone()).await;
    shutdown.cancel();

    let produced = producer.await.context("reading source task panicked")?;
    if let Some(relay) = relay {
        let published = relay.await.context("feed relay task panicked")?;
        info!(published, "feed relay stopped");
    }
    let stats = outcome.context("recorder failed")?;
    produced.context("reading source failed")?;

    info!(
        readings = stats.readings,
        rows = stats.rows_written,
        "recorder finished"
    );
    Ok(())
}
