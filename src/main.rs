use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use darc::config::AppConfig;
use darc::context::AppContext;
use darc::core::{
    Coordinator, EventReceiver, ItemState, ItemStatus, ProgressEvent, ProgressReporter, RunResult,
};
use darc::db::StateStore;
use darc::error::PipelineError;
use darc::logging::{self, LogConfig, ProgressThrottle};
use darc::adapters;

#[derive(Parser)]
#[command(name = "darc")]
#[command(about = "Archive large files from your Drive to a local folder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $DARC_CONFIG or ./darc.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable output and JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files in the account
    Scan,
    /// Show what an archive run would do
    Plan,
    /// Archive eligible files (dry run unless --execute)
    Archive(ArchiveArgs),
    /// Inspect or edit the archive history
    State {
        #[command(subcommand)]
        action: StateCommand,
    },
    /// Write a config file with the defaults
    InitConfig { path: Option<PathBuf> },
}

#[derive(Subcommand)]
enum StateCommand {
    List,
    /// Forget one file so the next run considers it again
    Forget { remote_id: String },
    Clear,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    archive_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    state_db: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    min_size_mb: Option<u64>,

    /// Only archive files last modified before this date (YYYY-MM-DD)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    modified_before: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    include_native_docs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,
}

#[derive(Args, Default, Clone, Copy)]
struct ArchiveArgs {
    /// Actually download and trash. Without it nothing is changed.
    #[arg(long)]
    execute: bool,

    /// Keep the originals in the Drive after archiving
    #[arg(long)]
    keep_originals: bool,
}

/// Everything the command line contributes to the config.
#[derive(Serialize)]
struct CliLayer<'a> {
    #[serde(flatten)]
    overrides: &'a Overrides,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trash_after: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        let path = path.clone().unwrap_or_else(|| PathBuf::from("darc.toml"));
        AppConfig::write_default(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let archive_args = match &cli.command {
        Commands::Archive(args) => Some(*args),
        _ => None,
    };
    let layer = CliLayer {
        overrides: &cli.overrides,
        json_logs: cli.json.then_some(true),
        dry_run: archive_args.filter(|a| a.execute).map(|_| false),
        trash_after: archive_args.filter(|a| a.keep_originals).map(|_| false),
    };
    let config = AppConfig::new(cli.config.as_deref(), Some(&layer))?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Scan => run_scan(build_context(config).await?, cli.json).await,
        Commands::Plan => run_plan(build_context(config).await?, cli.json).await,
        Commands::Archive(_) => run_archive(build_context(config).await?, cli.json).await,
        Commands::State { action } => run_state(&config.state_db, action, cli.json).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn build_context(config: AppConfig) -> Result<AppContext> {
    let state = StateStore::open(&config.state_db)
        .await
        .with_context(|| format!("Failed to open state database {}", config.state_db.display()))?;
    let storage = adapters::get_storage(&config).context("Failed to set up storage client")?;
    Ok(AppContext::new(config, state, storage))
}

/// Log the detail, surface the calm message.
fn pipeline_failure(e: PipelineError) -> anyhow::Error {
    error!(error = %e, "Run aborted");
    anyhow!(e.user_message())
}

async fn run_scan(ctx: AppContext, json: bool) -> Result<()> {
    let files = Coordinator::new(ctx)
        .scan()
        .await
        .map_err(pipeline_failure)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    for file in &files {
        println!("{:>10}  {}  {}", format_size(file.size), file.id, file.name);
    }
    let total: u64 = files.iter().map(|f| f.size).sum();
    println!("\n{} files, {}", files.len(), format_size(total));
    Ok(())
}

async fn run_plan(ctx: AppContext, json: bool) -> Result<()> {
    let coordinator = Coordinator::new(ctx);
    let files = coordinator.scan().await.map_err(pipeline_failure)?;
    let plan = coordinator
        .plan(&files, Utc::now())
        .await
        .map_err(pipeline_failure)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for item in &plan.items {
        let size = item
            .expected_size
            .map(format_size)
            .unwrap_or_else(|| "export".to_string());
        let resume = if item.resume.is_some() { "  (finish trash)" } else { "" };
        println!(
            "{:>10}  {}  ->  {}{}",
            size,
            item.name,
            item.destination.display(),
            resume
        );
    }

    let mut reasons: BTreeMap<String, usize> = BTreeMap::new();
    for skipped in &plan.skipped {
        *reasons.entry(skipped.reason.to_string()).or_insert(0) += 1;
    }
    println!("\n{} to archive, {} left alone", plan.items.len(), plan.skipped.len());
    for (reason, count) in reasons {
        println!("  {:>5}  {}", count, reason);
    }
    Ok(())
}

async fn run_archive(ctx: AppContext, json: bool) -> Result<()> {
    if ctx.config.dry_run {
        info!("Dry run: nothing will be downloaded or trashed (use --execute)");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight files");
            signal_cancel.cancel();
        }
    });

    let (events, rx) = ProgressReporter::channel();
    let printer = tokio::spawn(print_events(rx, json));

    let result = Coordinator::new(ctx).run(events, cancel).await;
    // The printer ends once every sender is dropped
    let _ = printer.await;
    let result = result.map_err(pipeline_failure)?;

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(())
}

async fn print_events(mut rx: EventReceiver, json: bool) {
    let mut throttle = ProgressThrottle::new(Duration::from_secs(2));

    while let Some(event) = rx.recv().await {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
            continue;
        }

        match event {
            ProgressEvent::Transition {
                remote_id,
                name,
                state,
                error,
            } => {
                if state.is_terminal() {
                    throttle.finish(&remote_id);
                }
                match state {
                    ItemState::Downloading => println!("  ↓ {}", name),
                    ItemState::Done => println!("  ✓ {}", name),
                    ItemState::Failed => {
                        println!("  ✗ {}: {}", name, error.unwrap_or_default())
                    }
                    _ => {}
                }
            }
            ProgressEvent::Bytes {
                remote_id,
                downloaded,
                total,
            } => {
                if throttle.should_log(&remote_id) {
                    match total {
                        Some(total) => info!(
                            remote_id = %remote_id,
                            "{} of {}",
                            format_size(downloaded),
                            format_size(total)
                        ),
                        None => info!(remote_id = %remote_id, "{}", format_size(downloaded)),
                    }
                }
            }
            ProgressEvent::Skipped { remote_id, name } => {
                throttle.finish(&remote_id);
                println!("  - {} (not started)", name)
            }
            ProgressEvent::RunStarted {
                eligible, dry_run, ..
            } => {
                let mode = if dry_run { " (dry run)" } else { "" };
                println!("Archiving {} file(s){}", eligible, mode);
            }
            ProgressEvent::RunFinished { .. } => {}
        }
    }
}

fn print_summary(result: &RunResult) {
    if result.dry_run {
        for outcome in &result.outcomes {
            if let Some(destination) = &outcome.destination {
                println!("  {}  ->  {}", outcome.name, destination.display());
            }
        }
    }

    let verb = if result.dry_run { "would archive" } else { "archived" };
    println!(
        "\n{} {}, {} failed, {} not started",
        result.succeeded, verb, result.failed, result.skipped
    );

    for outcome in result
        .outcomes
        .iter()
        .filter(|o| o.status == ItemStatus::Failed)
    {
        if let Some(error) = &outcome.error {
            println!("  {}: {}", outcome.name, error.message);
        }
    }
}

async fn run_state(db_path: &Path, action: StateCommand, json: bool) -> Result<()> {
    let store = StateStore::open(db_path)
        .await
        .with_context(|| format!("Failed to open state database {}", db_path.display()))?;

    match action {
        StateCommand::List => {
            let records = store.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            for record in &records {
                println!(
                    "{}  {:<12}  {:>10}  {}",
                    record.archived_at.format("%Y-%m-%d %H:%M"),
                    record.status.as_str(),
                    format_size(record.size),
                    record.local_path.display()
                );
            }
            println!("\n{} record(s)", records.len());
        }
        StateCommand::Forget { remote_id } => {
            if store.forget(&remote_id).await? {
                println!("Forgot {}", remote_id);
            } else {
                println!("No record for {}", remote_id);
            }
        }
        StateCommand::Clear => {
            let removed = store.clear().await?;
            println!("Removed {} record(s)", removed);
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
