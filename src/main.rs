use accrete_aggregate::{AggregateSink, AggregationEngine};
use accrete_core::config::{AppConfig, LogFormat, LoggingConfig};
use accrete_core::error::DeliveryError;
use accrete_core::Exchange;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Accrete - correlation-based message aggregator
///
/// Reads JSON exchanges (one per line) and writes completed aggregates as
/// JSON lines to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/accrete.yaml")]
    config: PathBuf,

    /// Read exchanges from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, env = "ACCRETE_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Writes completed aggregates to stdout, one JSON document per line.
struct StdoutSink {
    out: Mutex<io::Stdout>,
}

impl StdoutSink {
    fn new() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }
}

#[async_trait]
impl AggregateSink for StdoutSink {
    async fn process(&self, exchange: Exchange) -> Result<(), DeliveryError> {
        let exchange_id = exchange.id();
        let mut line = serde_json::to_vec(&exchange)
            .map_err(|e| DeliveryError::sink_failed(exchange_id, e.to_string()))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| DeliveryError::sink_failed(exchange_id, e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| DeliveryError::sink_failed(exchange_id, e.to_string()))
    }
}

fn init_logging(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    let _ = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

/// Feeds every line of `reader` into the engine. Returns the number of
/// exchanges accepted.
async fn pump<R>(engine: &AggregationEngine, reader: R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut accepted = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let exchange: Exchange = match serde_json::from_str(line) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed exchange");
                continue;
            }
        };

        match engine.submit(exchange).await {
            Ok(()) => accepted += 1,
            Err(e) => warn!(line = line_no, error = %e, "Exchange rejected"),
        }
    }

    Ok(accepted)
}

async fn run(engine: &AggregationEngine, input: Option<PathBuf>) -> Result<usize> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open input file: {:?}", path))?;
            pump(engine, file).await
        }
        None => pump(engine, io::stdin()).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration file
    let mut config = AppConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);
    info!("Configuration loaded from {:?}", args.config);

    let engine = AggregationEngine::builder(config.aggregator)
        .sink(StdoutSink::new())
        .build()?;
    engine.start().await?;

    tokio::select! {
        result = run(&engine, args.input) => {
            match result {
                Ok(accepted) => info!(accepted, "Input exhausted"),
                Err(e) => error!(error = %e, "Input failed"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping aggregator...");
        }
    }

    engine.stop().await?;

    let stats = engine.statistics().snapshot();
    info!(
        total_in = stats.total_in,
        total_completed = stats.total_completed,
        discarded = stats.discarded,
        "Aggregator stopped"
    );

    Ok(())
}
