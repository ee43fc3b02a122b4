//! sbd - suit builder coordinator
//!
//! CLI entry point: run the coordinator, or inspect definitions and build
//! records offline.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use suitbuilder::cli::{Cli, Command};
use suitbuilder::config::Config;
use suitbuilder::coordinator::Coordinator;
use suitbuilder::domain::{BuildStatus, WorkItemStatus};
use suitbuilder::ipc;
use suitbuilder::parser::ParserChain;
use suitbuilder::persistence::{BuildPersistenceManager, PersistenceError};
use suitbuilder::queue::command_channel;
use suitbuilder::tables::Tables;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("suitbuilder")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("sbd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve { listen } => cmd_serve(config, listen).await,
        Command::Check { file, verbose } => cmd_check(&config, &file, verbose),
        Command::History { count } => cmd_history(&config, count),
        Command::State => cmd_state(&config),
    }
}

async fn cmd_serve(mut config: Config, listen: Option<String>) -> Result<()> {
    if let Some(addr) = listen {
        config.server.listen_addr = addr;
    }
    let (commands, queue) = command_channel();
    let mut coordinator = Coordinator::from_config(&config, queue).context("Failed to create coordinator")?;

    if let Some(report) = coordinator.recover(Utc::now()) {
        warn!(%report, "Crashed build found");
        println!(
            "{} Crashed {}. Resume or abandon it from a worker.",
            "!".yellow(),
            report
        );
    }

    let listener = ipc::bind(&config.server.listen_addr).await?;
    println!(
        "{} Listening on {} (definitions: {})",
        "✓".green(),
        config.server.listen_addr.cyan(),
        config.storage.definitions_dir.display()
    );

    let accept = tokio::spawn(async move {
        if let Err(e) = ipc::serve(listener, commands).await {
            warn!(error = %e, "Listener stopped");
        }
    });

    coordinator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received, shutting down");
        })
        .await?;

    accept.abort();
    println!("{} Stopped", "✓".green());
    Ok(())
}

fn cmd_check(config: &Config, file: &Path, verbose: bool) -> Result<()> {
    let tables = load_tables(config)?;
    let parser = ParserChain::new(tables).context("Failed to compile definition grammars")?;
    let report = parser
        .parse_file(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    println!("Definition: {}", file.display().to_string().cyan());
    println!("  Items: {}", report.items.len());
    println!("  Duplicates: {}", report.duplicates.len());
    println!("  Unparsed lines: {}", report.failures.len());

    if verbose {
        for item in &report.items {
            println!(
                "  {:>3} {} {} {} {:?}",
                item.id.to_string().dimmed(),
                item.character.yellow(),
                item.item_name,
                format!("mat={} set={}", item.material_id, item.set_id).dimmed(),
                item.requirements
            );
        }
    }
    for dup in &report.duplicates {
        println!("  {} duplicate: {} ({})", "-".yellow(), dup.item_name, dup.character);
    }
    for failure in &report.failures {
        println!("  {} {}", "✗".red(), failure);
    }

    if report.items.is_empty() {
        return Err(eyre!("No valid items found in {}", file.display()));
    }
    Ok(())
}

fn cmd_history(config: &Config, count: usize) -> Result<()> {
    let Some(manager) = open_persistence(config)? else {
        println!("No build history");
        return Ok(());
    };
    let entries = manager.get_recent_history(count);
    if entries.is_empty() {
        println!("No build history");
        return Ok(());
    }
    for entry in entries {
        let status = match entry.final_status {
            BuildStatus::Completed => entry.final_status.to_string().green(),
            BuildStatus::Cancelled => entry.final_status.to_string().yellow(),
            _ => entry.final_status.to_string().red(),
        };
        println!(
            "{} {} {} {}/{} items, {}s{}",
            entry.end_time.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            status,
            entry.suit_name.cyan(),
            entry.completed_items,
            entry.total_items,
            entry.duration_secs(),
            if entry.was_resumed { " (resumed)" } else { "" }
        );
        if let Some(reason) = &entry.failure_reason {
            println!("    {}", reason.red());
        }
    }
    Ok(())
}

fn cmd_state(config: &Config) -> Result<()> {
    let state = match open_persistence(config)? {
        Some(manager) => manager.load_active_state(),
        None => None,
    };
    let Some(state) = state else {
        println!("No active build");
        return Ok(());
    };

    let stats = state.statistics(state.last_save.unwrap_or_else(Utc::now));
    println!("Build: {} ({})", state.suit_name.cyan(), state.build_id.dimmed());
    println!("  Status: {}", state.status);
    println!("  Drop character: {}", state.drop_character);
    println!(
        "  Progress: {}/{} ({:.1}%)",
        stats.completed_items, stats.total_items, stats.progress_percentage
    );
    println!(
        "  Pending: {}  In progress: {}  Failed: {}",
        stats.pending_items, stats.in_progress_items, stats.failed_items
    );
    println!("  Resumed: {} time(s)", state.resume_count);
    for item in state.remaining_items() {
        let marker = match item.status {
            WorkItemStatus::Failed => "✗".red(),
            WorkItemStatus::InProgress => "~".yellow(),
            _ => "-".normal(),
        };
        println!("  {} {} {}", marker, item.character.yellow(), item.item_name);
    }
    Ok(())
}

fn load_tables(config: &Config) -> Result<Tables> {
    match &config.tables_path {
        Some(path) => Tables::load(path).context("Failed to load lookup tables"),
        None => Ok(Tables::builtin()),
    }
}

/// Open the data directory without creating it
fn open_persistence(config: &Config) -> Result<Option<BuildPersistenceManager>> {
    match BuildPersistenceManager::open_existing(&config.storage.data_dir, config.persistence.history_cap) {
        Ok(manager) => Ok(Some(manager)),
        Err(PersistenceError::Unavailable(reason)) => {
            debug!(%reason, "open_persistence: no data directory");
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to open build data"),
    }
}
