use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jmir_core::SyncResult;
use jmir_storage::RecordStore;
use jmir_sync::{build_scheduler, build_service, AppConfig, JiraSyncService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PROJECT_STATS_ROWS: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "jmir")]
#[command(about = "Mirror Jira issues into a local SQLite store")]
struct Cli {
    /// YAML configuration file; falls back to JMIR_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Force a full sync regardless of configuration.
    #[arg(long, global = true)]
    full_sync: bool,
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Sync,
    TestConnection,
    Status,
    InitDb,
    /// Sync once, then keep syncing on the configured cron until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %format!("{err:#}"), "application terminated unexpectedly");
            eprintln!("Fatal error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    print_configuration(&config);

    let service = Arc::new(build_service(&config).context("building sync service")?);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let outcome = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let ok = sync_once(&service, cli.full_sync, &cancel).await?;
            if ok && config.sync.scheduler_enabled {
                watch(service.clone(), &config, &cancel).await
            } else {
                Ok(ok)
            }
        }
        Commands::TestConnection => Ok(test_connections(&service).await),
        Commands::Status => {
            print_status(&service).await;
            Ok(true)
        }
        Commands::InitDb => {
            service
                .store()
                .apply_schema()
                .await
                .context("applying database schema")?;
            println!("Database initialized at {}", config.database.path);
            Ok(true)
        }
        Commands::Watch => {
            if sync_once(&service, cli.full_sync, &cancel).await? {
                watch(service.clone(), &config, &cancel).await
            } else {
                Ok(false)
            }
        }
    };

    service.store().close().await;
    outcome
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; cancelling");
            cancel.cancel();
        }
    });
}

async fn test_connections(service: &JiraSyncService) -> bool {
    println!("\nTesting connections...");
    if service.test_connections().await {
        println!("All connections successful");
        true
    } else {
        println!("Connection tests failed. Please check your configuration.");
        false
    }
}

async fn sync_once(
    service: &JiraSyncService,
    prefer_full: bool,
    cancel: &CancellationToken,
) -> Result<bool> {
    if !test_connections(service).await {
        return Ok(false);
    }

    let full = prefer_full || service.options().full_sync_on_startup;
    println!(
        "\nStarting {} synchronization...",
        if full { "full" } else { "incremental" }
    );
    let result = service.sync(prefer_full, cancel).await;
    print_result(&result);
    if !result.success {
        return Ok(false);
    }

    print_project_stats(service).await;
    println!("\nSynchronization finished successfully");
    Ok(true)
}

async fn watch(
    service: Arc<JiraSyncService>,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mut sched = build_scheduler(service, &config.sync.cron, cancel.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync.cron, "scheduler started");
    println!("\nWatching on cron '{}'; press Ctrl-C to stop", config.sync.cron);

    cancel.cancelled().await;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(true)
}

fn print_configuration(config: &AppConfig) {
    println!("Configuration summary:");
    println!("   Jira server: {}", config.jira.base_url);
    println!("   Username: {}", config.jira.username);
    println!("   Database: {}", config.database.path);
    println!(
        "   Projects: {}",
        if config.jira.project_keys.is_empty() {
            "(none configured)".to_string()
        } else {
            config.jira.project_keys.join(", ")
        }
    );
    println!("   Batch size: {}", config.sync.batch_size);
    println!("   Lookback: {} days", config.sync.lookback_days);
}

fn print_result(result: &SyncResult) {
    let secs = result.duration().as_secs();
    println!("\nSynchronization results ({}):", result.mode);
    println!(
        "   Status: {}",
        if result.success { "success" } else { "failed" }
    );
    println!("   Duration: {:02}:{:02}", secs / 60, secs % 60);
    println!("   Issues processed: {}", result.issues_processed);
    println!("   Issues inserted: {}", result.issues_inserted);
    println!("   Issues updated: {}", result.issues_updated);
    if !result.warnings.is_empty() {
        println!("   Warnings: {}", result.warnings.len());
        for warning in &result.warnings {
            println!("     - {warning}");
        }
    }
    if let Some(message) = &result.error_message {
        println!("   Error: {message}");
    }
}

async fn print_project_stats(service: &JiraSyncService) {
    match service.store().project_summaries().await {
        Ok(summaries) if summaries.is_empty() => {}
        Ok(summaries) => {
            println!("\nProject statistics:");
            for s in summaries.iter().take(PROJECT_STATS_ROWS) {
                println!(
                    "   {} ({}): {} issues, {} open, {} in progress, {} resolved",
                    s.project_name,
                    s.project_key,
                    s.total_issues,
                    s.open_issues,
                    s.in_progress_issues,
                    s.resolved_issues
                );
            }
        }
        Err(err) => warn!(error = %err, "could not read project statistics"),
    }
}

async fn print_status(service: &JiraSyncService) {
    let status = service.last_sync_status().await;
    println!("\nSync status:");
    println!("   Healthy: {}", status.healthy);
    println!(
        "   Last full sync: {}",
        status
            .last_full_sync
            .map_or_else(|| "never".to_string(), |ts| ts.to_rfc3339())
    );
    println!(
        "   Last incremental sync: {}",
        status
            .last_incremental_sync
            .map_or_else(|| "never".to_string(), |ts| ts.to_rfc3339())
    );
    println!("   Issues: {}", status.total_issues);
    println!("   Projects: {}", status.total_projects);
    if let Some(err) = &status.last_error {
        println!("   Last error: {err}");
    }
    print_project_stats(service).await;
}
