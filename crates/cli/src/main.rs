//! execwatch - start executions and follow their progress from a terminal

mod commands;
mod config;
mod observer;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watch_client::{ApiClient, TransportKind};

use crate::commands::WatchOptions;

/// execwatch - Execution progress viewer
#[derive(Parser)]
#[command(name = "execwatch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Start executions and follow their progress live")]
#[command(long_about = r#"
execwatch follows a multi-phase execution on the server and renders its
progress as a checklist. Events arrive over SSE or a WebSocket; snapshots
are polled alongside so the view converges even if the stream drops.

Examples:
  execwatch start "deploy the staging stack"
  execwatch watch 3f2a9c --transport websocket
  execwatch status 3f2a9c
  execwatch records 3f2a9c --limit 20
"#)]
struct Cli {
    /// Server URL (overrides server.url from the config file)
    #[arg(long, env = "EXECWATCH_SERVER_URL")]
    server: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an execution and watch it
    Start {
        /// What the execution should do
        intent: String,

        #[command(flatten)]
        watch: WatchArgs,
    },

    /// Watch an existing execution
    Watch {
        /// Execution ID
        id: String,

        #[command(flatten)]
        watch: WatchArgs,
    },

    /// Show one snapshot of an execution
    Status {
        /// Execution ID
        id: String,
    },

    /// List recent history records of an execution
    Records {
        /// Execution ID
        id: String,

        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Configuration management
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Set a configuration value (key=value)
        #[arg(long)]
        set: Option<String>,
    },
}

#[derive(clap::Args)]
struct WatchArgs {
    /// Streaming transport (sse or websocket)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Rely on the stream alone, without snapshot polling
    #[arg(long)]
    no_poll: bool,
}

impl From<WatchArgs> for WatchOptions {
    fn from(args: WatchArgs) -> Self {
        Self {
            transport: args.transport,
            no_poll: args.no_poll,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("watch_client={0},execwatch={0},warn", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = config::Config::load()?;
    if let Some(server) = cli.server {
        config.server.url = server;
    }

    let api = ApiClient::new(&config.server.url, config.watch.connect_timeout())
        .context("Failed to create API client")?
        .with_api_key(config.server.api_key.clone());

    match cli.command {
        Commands::Start { intent, watch } => {
            commands::start(&api, &config, &intent, watch.into()).await?;
        }
        Commands::Watch { id, watch } => {
            commands::watch(&api, &config, &id, watch.into()).await?;
        }
        Commands::Status { id } => {
            commands::status(&api, &id).await?;
        }
        Commands::Records { id, limit } => {
            commands::records(&api, &id, limit).await?;
        }
        Commands::Config { show, set } => {
            if show {
                commands::show_config(&config)?;
            } else if let Some(kv) = set {
                commands::set_config(&kv)?;
            } else {
                commands::show_config(&config)?;
            }
        }
    }

    Ok(())
}
