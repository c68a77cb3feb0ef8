//! reqtrace CLI: replay captured message streams, inspect reconstructed
//! records, and derive session summaries from the persisted snapshot.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::warn;

use reqtrace_core::aggregator::RequestAggregator;
use reqtrace_core::clock::system_clock;
use reqtrace_core::config::Config;
use reqtrace_core::events::ObserverMessage;
use reqtrace_core::logging::{LogConfig, LogFormat, init_logging};
use reqtrace_core::persist::{KeyValuePort, SqliteKv};

#[derive(Parser)]
#[command(name = "reqtrace", version, about = "Request lifecycle aggregator and session correlator")]
struct Cli {
    /// Path to reqtrace.toml (defaults to ./reqtrace.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long, global = true)]
    db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log output format (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Optional log file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines stream of observer messages into the store
    Replay {
        /// Input file, or `-` for stdin
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Consume observer messages from stdin until EOF, with periodic
    /// debounced flushing and retention sweeps
    Watch,

    /// Print all reconstructed records as JSON lines
    Records,

    /// Derive and print the session summary for a domain
    Summarize {
        /// Domain to summarize, e.g. `bank.example`
        #[arg(long, short)]
        domain: String,
    },

    /// Print metadata of the last persisted snapshot
    Meta,

    /// Run one retention sweep against the persisted records
    Sweep,

    /// Delete all records
    Clear,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(db) = &cli.db {
        config.persist.db_path.clone_from(db);
    }
    Ok(config)
}

/// Expand a leading `~/` against $HOME.
fn expand_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn open_aggregator(config: &Config) -> anyhow::Result<RequestAggregator> {
    let db_path = expand_path(&config.persist.db_path);
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let port: Arc<dyn KeyValuePort> =
        Arc::new(SqliteKv::open(&db_path).with_context(|| format!("failed to open {db_path}"))?);
    let aggregator = RequestAggregator::new(config, port, system_clock())?;
    aggregator.restore()?;
    Ok(aggregator)
}

fn replay(aggregator: &RequestAggregator, input: &PathBuf) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = if input.as_os_str() == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("failed to open {}", input.display()))?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut processed = 0usize;
    let mut failed = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ObserverMessage>(&line) {
            Ok(msg) => {
                aggregator.handle_message(&msg)?;
                processed += 1;
            }
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "Skipping unparseable message");
                failed += 1;
            }
        }
    }
    aggregator.flush_now()?;

    println!(
        "{}",
        serde_json::json!({
            "processed": processed,
            "failed": failed,
            "records": aggregator.record_count()?,
        })
    );
    Ok(())
}

/// Long-running ingest: one message per stdin line until EOF.
async fn watch(aggregator: Arc<RequestAggregator>) -> anyhow::Result<()> {
    use tokio::io::AsyncBufReadExt;

    let maintenance = aggregator.spawn_maintenance();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut processed = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ObserverMessage>(&line) {
            Ok(msg) => {
                aggregator.handle_message(&msg)?;
                processed += 1;
            }
            Err(err) => warn!(error = %err, "Skipping unparseable message"),
        }
    }
    maintenance.abort();
    aggregator.flush_now()?;
    println!(
        "{}",
        serde_json::json!({ "processed": processed, "records": aggregator.record_count()? })
    );
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let aggregator = open_aggregator(&config)?;

    match &cli.command {
        Command::Replay { input } => replay(&aggregator, input)?,
        Command::Watch => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(watch(Arc::new(aggregator)))?;
            return Ok(());
        }
        Command::Records => {
            let mut records = aggregator.get_all_records()?;
            records.sort_by(|a, b| {
                a.start_time
                    .cmp(&b.start_time)
                    .then_with(|| a.request_id.cmp(&b.request_id))
            });
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Summarize { domain } => match aggregator.summarize(domain)? {
            Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
            None => bail!("no session found for domain {domain}"),
        },
        Command::Meta => match aggregator.snapshot_meta()? {
            Some(meta) => println!("{}", serde_json::to_string(&meta)?),
            None => println!("null"),
        },
        Command::Sweep => {
            let result = aggregator.sweep()?;
            aggregator.flush_now()?;
            println!(
                "{}",
                serde_json::json!({ "removed": result.removed, "retained": result.retained })
            );
        }
        Command::Clear => {
            aggregator.clear_all()?;
            aggregator.flush_now()?;
            println!("cleared");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    run(&cli)
}
