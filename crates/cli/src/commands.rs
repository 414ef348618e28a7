//! CLI subcommand handlers

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{debug, warn};
use watch_client::{
    ApiClient, ApiError, ExecutionStatus, Progress, ProgressTracker, Snapshot, TransportKind,
    WatchConfig, Watcher,
};

use crate::{config::Config, observer::TerminalObserver, output::OutputHandler};

/// Per-invocation overrides for `start` and `watch`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub transport: Option<TransportKind>,
    pub no_poll: bool,
}

impl WatchOptions {
    pub fn apply(&self, config: &WatchConfig) -> WatchConfig {
        let mut config = config.clone();
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if self.no_poll {
            config.polling = false;
        }
        config
    }
}

/// Progress implied by a single snapshot.
fn snapshot_progress(snapshot: &Snapshot) -> Progress {
    let mut tracker = ProgressTracker::new();
    for event in snapshot.to_events() {
        tracker.apply(&event);
    }
    tracker.progress().clone()
}

/// Start an execution and follow it
pub async fn start(
    api: &ApiClient,
    config: &Config,
    intent: &str,
    opts: WatchOptions,
) -> Result<()> {
    let output = OutputHandler::new(false);

    let started = api
        .start_execution(intent)
        .await
        .context("Failed to start execution")?;
    output.print_success(&format!("Started execution {}", started.id));

    follow(api, config, &started.id, started.status, opts).await
}

/// Attach to an existing execution
pub async fn watch(
    api: &ApiClient,
    config: &Config,
    execution_id: &str,
    opts: WatchOptions,
) -> Result<()> {
    let output = OutputHandler::new(false);

    let initial_status = match api.get_snapshot(execution_id).await {
        Ok(snapshot) if snapshot.status.is_terminal() => {
            output.print_header(&format!("Execution {} ({})", snapshot.id, snapshot.status));
            output.print_progress(&snapshot_progress(&snapshot));
            return Ok(());
        }
        Ok(snapshot) => snapshot.status,
        Err(ApiError::NotFound(_)) => {
            // The stream may still come up if the execution is just starting.
            warn!("No snapshot for {} yet", execution_id);
            ExecutionStatus::Pending
        }
        Err(e) => return Err(e).context("Failed to fetch execution"),
    };

    follow(api, config, execution_id, initial_status, opts).await
}

async fn follow(
    api: &ApiClient,
    config: &Config,
    execution_id: &str,
    initial_status: ExecutionStatus,
    opts: WatchOptions,
) -> Result<()> {
    let output = OutputHandler::new(true);
    let watch_config = opts.apply(&config.watch);
    debug!("Watching {} with {:?}", execution_id, watch_config);

    let transport = watch_config
        .build_transport(&config.server.url, config.server.api_key.clone())
        .context("Failed to set up transport")?;
    let watcher = Watcher::new(transport)
        .with_snapshots(Arc::new(api.clone()))
        .with_config(watch_config.clone())
        .with_observer(Arc::new(TerminalObserver::new(output)));

    output.print_header(&format!(
        "Watching {} over {}",
        execution_id, watch_config.transport
    ));

    let handle = watcher.watch(execution_id, initial_status);
    let progress_rx = handle.subscribe_progress();

    let result = tokio::select! {
        result = handle.wait() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let progress = match result {
        Some(result) => result.with_context(|| format!("Watching {} failed", execution_id))?,
        None => {
            println!();
            output.print_warning("Interrupted; the execution keeps running on the server");
            progress_rx.borrow().clone()
        }
    };

    output.print_header("Summary");
    output.print_progress(&progress);

    if progress.is_failed {
        anyhow::bail!(
            "Execution {} failed: {}",
            execution_id,
            progress.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Print one snapshot
pub async fn status(api: &ApiClient, execution_id: &str) -> Result<()> {
    let output = OutputHandler::new(false);

    let snapshot = api
        .get_snapshot(execution_id)
        .await
        .with_context(|| format!("Failed to fetch execution {}", execution_id))?;

    output.print_header("Execution Status");
    output.print_snapshot(&snapshot);
    println!();
    output.print_progress(&snapshot_progress(&snapshot));

    Ok(())
}

/// List recent history records
pub async fn records(api: &ApiClient, execution_id: &str, limit: usize) -> Result<()> {
    let output = OutputHandler::new(false);

    output.print_header(&format!("Recent Records (last {})", limit));

    let records = api
        .list_recent_records(execution_id, limit)
        .await
        .with_context(|| format!("Failed to list records for {}", execution_id))?;

    if records.is_empty() {
        output.print_info("No records found.");
        return Ok(());
    }

    output.print_records_table(&records);
    Ok(())
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    let output = OutputHandler::new(false);

    output.print_header("Configuration");

    println!();
    println!("  {}", "[server]".bright_cyan());
    println!("    {} = \"{}\"", "url".dimmed(), config.server.url);
    println!(
        "    {} = {}",
        "api_key".dimmed(),
        if config.server.api_key.is_some() {
            "\"***\"".to_string()
        } else {
            "not set".dimmed().to_string()
        }
    );

    let watch = &config.watch;
    println!();
    println!("  {}", "[watch]".bright_cyan());
    println!("    {} = \"{}\"", "transport".dimmed(), watch.transport);
    println!("    {} = {}", "polling".dimmed(), watch.polling);
    println!("    {} = {}", "poll_interval_secs".dimmed(), watch.poll_interval_secs);
    println!("    {} = {}", "keepalive_secs".dimmed(), watch.keepalive_secs);
    println!("    {} = {}", "connect_timeout_secs".dimmed(), watch.connect_timeout_secs);

    println!();
    println!("  {}", "[watch.reconnect]".bright_cyan());
    println!("    {} = {}", "base_delay_ms".dimmed(), watch.reconnect.base_delay_ms);
    println!("    {} = {}", "max_attempts".dimmed(), watch.reconnect.max_attempts);

    println!();
    println!(
        "  {} {}",
        "Config file:".dimmed(),
        Config::config_path().display()
    );

    Ok(())
}

/// Set a configuration value
pub fn set_config(kv: &str) -> Result<()> {
    let output = OutputHandler::new(false);

    let Some((key, value)) = kv.split_once('=') else {
        output.print_error("Invalid format. Use: key=value");
        return Ok(());
    };

    let key = key.trim();
    let value = value.trim().trim_matches('"');

    let mut config = Config::load()?;
    match config.set(key, value).and_then(|()| config.save()) {
        Ok(()) => {
            output.print_success(&format!("Set {} = \"{}\"", key, value));
        }
        Err(e) => {
            output.print_error(&format!("Failed to set config: {:#}", e));
        }
    }

    Ok(())
}
