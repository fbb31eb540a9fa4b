//! Command-line interface for the LokaSync OTA log backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use lokasync_core::{targets, Config, FlashStatus, LoggingSettings};
use lokasync_ingest::LogIngestService;
use lokasync_storage::{LogFilter, RedbSessionStore, SessionStore};

/// LokaSync - OTA firmware update log ingestion for ESP32 nodes.
#[derive(Parser, Debug)]
#[command(name = "lokasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML config file. Environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MQTT ingest pipeline until Ctrl-C.
    Serve,
    /// Query and administer stored update logs.
    Logs {
        #[command(subcommand)]
        logs_cmd: LogsCommand,
    },
}

/// Log subcommands.
#[derive(Subcommand, Debug)]
enum LogsCommand {
    /// List logs, newest first.
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Page number, starting at 1.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        page: u32,
        /// Logs per page.
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=100))]
        page_size: u32,
    },
    /// Count logs matching the filters.
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show the log for a session.
    Show {
        #[arg(required = true)]
        session_id: String,
    },
    /// Delete the log for a session.
    Delete {
        #[arg(required = true)]
        session_id: String,
    },
    /// Show the values available for filtering.
    Filters,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Node location.
    #[arg(long)]
    location: Option<String>,
    /// Node type.
    #[arg(long = "type")]
    node_type: Option<String>,
    /// Flash status: "in progress", "success" or "failed".
    #[arg(long)]
    status: Option<FlashStatus>,
}

impl From<FilterArgs> for LogFilter {
    fn from(args: FilterArgs) -> Self {
        LogFilter {
            node_location: args.location,
            node_type: args.node_type,
            flash_status: args.status,
            ..Default::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let _guard = init_logging(&config.logging)?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Logs { logs_cmd } => run_logs_cmd(config, logs_cmd).await,
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// on drop and must live as long as the process.
fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    let console = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file, guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "lokasync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();

    Ok(guard)
}

fn open_store(config: &Config) -> Result<RedbSessionStore> {
    let path = config.storage.logs_db_path();
    RedbSessionStore::open(&path)
        .with_context(|| format!("Failed to open session store at {}", path.display()))
}

async fn serve(config: Config) -> Result<()> {
    let store: Arc<dyn SessionStore> = Arc::new(open_store(&config)?);
    let service = LogIngestService::new(config, store)?;

    tracing::info!(target: targets::SYSTEM, "Starting LokaSync log ingestion");
    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!(target: targets::SYSTEM, "Shutdown requested");

    service.stop().await?;
    tracing::info!(
        target: targets::SYSTEM,
        health = ?service.health(),
        "LokaSync stopped"
    );
    Ok(())
}

async fn run_logs_cmd(config: Config, cmd: LogsCommand) -> Result<()> {
    let timezone = config.timezone()?;
    let store = open_store(&config)?;

    match cmd {
        LogsCommand::List {
            filter,
            page,
            page_size,
        } => {
            let filter = LogFilter::from(filter);
            let skip = (page as usize - 1) * page_size as usize;
            let total = store.count(&filter).await?;
            let logs = store.list(&filter, skip, page_size as usize).await?;
            tracing::debug!(
                target: targets::DB,
                page,
                page_size,
                total,
                returned = logs.len(),
                "Listed logs"
            );
            let wire: Vec<_> = logs.iter().map(|s| s.to_wire(&timezone)).collect();
            print_json(&wire)
        }
        LogsCommand::Count { filter } => {
            let total = store.count(&LogFilter::from(filter)).await?;
            println!("{}", total);
            Ok(())
        }
        LogsCommand::Show { session_id } => match store.get_by_session_id(&session_id).await? {
            Some(session) => print_json(&session.to_wire(&timezone)),
            None => bail!("No log found for session '{}'", session_id),
        },
        LogsCommand::Delete { session_id } => {
            let deleted = store.delete_by_session_id(&session_id).await?;
            if deleted == 0 {
                bail!("No log found for session '{}'", session_id);
            }
            tracing::info!(target: targets::DB, session_id = %session_id, "Log deleted");
            println!("Deleted {} log(s) for session '{}'", deleted, session_id);
            Ok(())
        }
        LogsCommand::Filters => print_json(&store.filter_options().await?),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
