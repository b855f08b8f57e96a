//! FHIR Bulk Export Orchestrator - Main Entry Point
//! Daemon (advance scheduler + retention sweeper) and operator commands

mod app;
mod config;
mod logging;

use anyhow::{Context, Result};
use app::App;
use clap::{Parser, Subcommand};
use config::AppConfig;
use fhir_export_core::application::shutdown_channel;
use fhir_export_core::domain::{ExportRequest, ExportScope, Grant, JobStatus, RequesterIdentity};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period for in-flight passes after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "fhir-export-daemon")]
#[command(about = "FHIR bulk export orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "FHIR_EXPORT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Who is acting; authentication happens upstream
#[derive(clap::Args, Debug)]
struct RequesterArgs {
    /// Requester id (job owner)
    #[arg(long)]
    owner: String,

    /// Requester tenant
    #[arg(long)]
    tenant: Option<String>,

    /// Requester may start system-wide exports
    #[arg(long)]
    system_grant: bool,

    /// Requester may act across tenants
    #[arg(long)]
    all_tenants: bool,
}

impl RequesterArgs {
    fn identity(&self) -> RequesterIdentity {
        let mut identity = RequesterIdentity::new(self.owner.clone());
        if let Some(tenant) = &self.tenant {
            identity = identity.with_tenant(tenant.clone());
        }
        if self.system_grant {
            identity = identity.with_grant(Grant::SystemExport);
        }
        if self.all_tenants {
            identity = identity.with_grant(Grant::AllTenants);
        }
        identity
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the advance scheduler and retention sweeper until Ctrl-C
    Run,

    /// Advance every active job once and print the report
    AdvanceOnce,

    /// Run one retention sweep
    SweepOnce {
        /// Reclaim free database pages afterwards
        #[arg(long)]
        vacuum: bool,
    },

    /// Show job store statistics
    Stats,

    /// Submit a new export
    Submit {
        #[command(flatten)]
        requester: RequesterArgs,

        /// `system`, `Patient`, `Patient/{id}` or `Group/{id}`
        #[arg(long)]
        scope: String,

        /// Resource types to export (comma separated)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        /// Only resources changed since this RFC 3339 instant
        #[arg(long)]
        since: Option<String>,

        /// Only resources changed before this RFC 3339 instant
        #[arg(long)]
        until: Option<String>,

        #[arg(long, default_value = "application/fhir+ndjson")]
        output_format: String,
    },

    /// Show one export job
    Status {
        #[command(flatten)]
        requester: RequesterArgs,

        job_id: String,
    },

    /// List the requester's jobs in one status
    List {
        #[command(flatten)]
        requester: RequesterArgs,

        #[arg(long, default_value = "RUNNING")]
        status: String,
    },

    /// Request cancellation of an export
    Stop {
        #[command(flatten)]
        requester: RequesterArgs,

        job_id: String,
    },
}

fn parse_instant(value: &str) -> Result<i64> {
    let instant = chrono::DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("'{}' is not an RFC 3339 timestamp", value))?;
    Ok(instant.timestamp_millis())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // 2. Initialize logging
    let _log_guard = logging::init(&config.logging)?;
    info!("FHIR export daemon v{} starting...", VERSION);

    // 3. Wire dependencies
    let app = App::build(config).await?;

    // 4. Dispatch
    match cli.command {
        Commands::Run => run(app).await,
        Commands::AdvanceOnce => {
            let report = app.scheduler().run_once().await?;
            println!(
                "examined={} transitioned={} unchanged={} deferred={} conflicts={} errors={}",
                report.examined,
                report.transitioned,
                report.unchanged,
                report.deferred,
                report.conflicts,
                report.errors
            );
            Ok(())
        }
        Commands::SweepOnce { vacuum } => {
            let report = app.sweeper().run_once().await?;
            println!(
                "reclaimed={} objects_deleted={} skipped={}",
                report.reclaimed, report.objects_deleted, report.skipped
            );
            if vacuum {
                let reclaimed_bytes = app.maintenance.vacuum().await?;
                println!("vacuum reclaimed_bytes={}", reclaimed_bytes);
            }
            Ok(())
        }
        Commands::Stats => {
            use fhir_export_core::port::Maintenance;
            let stats = app.maintenance.get_stats(app.now_millis()).await?;
            println!(
                "db_size_bytes={} jobs={} terminal={} expired={}",
                stats.db_size_bytes,
                stats.job_count,
                stats.terminal_job_count,
                stats.expired_job_count
            );
            Ok(())
        }
        Commands::Submit {
            requester,
            scope,
            types,
            since,
            until,
            output_format,
        } => {
            let scope: ExportScope = scope.parse()?;
            let mut request = ExportRequest::new(scope)
                .with_resource_types(types)
                .with_output_format(output_format);
            if let Some(since) = since {
                request = request.with_since(parse_instant(&since)?);
            }
            if let Some(until) = until {
                request = request.with_until(parse_instant(&until)?);
            }

            let job_id = app
                .orchestrator
                .start_export(&requester.identity(), request)
                .await?;
            println!("{}", job_id);
            Ok(())
        }
        Commands::Status { requester, job_id } => {
            let view = app
                .orchestrator
                .job_status(&requester.identity(), &job_id)
                .await?;
            print_json(&view)
        }
        Commands::List { requester, status } => {
            let status: JobStatus = status.parse()?;
            let views = app
                .orchestrator
                .list_jobs(&requester.identity(), status)
                .await?;
            print_json(&views)
        }
        Commands::Stop { requester, job_id } => {
            let ack = app
                .orchestrator
                .stop_export(&requester.identity(), &job_id)
                .await?;
            print_json(&ack)
        }
    }
}

async fn run(app: App) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    info!("Starting advance scheduler...");
    let scheduler_handle = tokio::spawn(app.scheduler().run(shutdown_rx.clone()));

    info!("Starting retention sweeper...");
    let sweeper_handle = tokio::spawn(app.sweeper().run(app.config.sweep_interval(), shutdown_rx));

    info!("System ready. Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Exiting gracefully...");
    shutdown_tx.shutdown();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = scheduler_handle.await;
        let _ = sweeper_handle.await;
    })
    .await;

    info!("Shutdown complete.");
    Ok(())
}
