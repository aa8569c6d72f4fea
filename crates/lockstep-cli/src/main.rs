//! lockstep - Schema mutation under live replication
//!
//! Every mutation is a single attempt under a short lock wait budget. Objects
//! that could not get their lock are reported and the command exits non-zero;
//! run it again until it exits zero.
//!
//! # Usage
//!
//! ```bash
//! # Install the capture trigger on every replicated table
//! lockstep -c lockstep.yaml triggers add
//!
//! # Take large indexes down on the secondary before the bulk copy
//! lockstep -c lockstep.yaml indexes install
//! lockstep -c lockstep.yaml indexes drop
//!
//! # Rebuild them once the copy has finished
//! lockstep -c lockstep.yaml indexes recreate --wait
//!
//! # Validate configuration
//! lockstep -c lockstep.yaml validate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lockstep_core::catalog::{ObjectCatalog, PgCatalog};
use lockstep_core::config::{DatabaseConfig, LockstepConfig};
use lockstep_core::executor::BoundedExecutor;
use lockstep_core::indexes::{recreate_after_copy, IndexManager};
use lockstep_core::model::{QualifiedName, ReplicationObject};
use lockstep_core::monitor::{CompletionMonitor, LogMarkerOracle, WaitOutcome};
use lockstep_core::report::RunReport;
use lockstep_core::snapshot_store::{IndexRecord, PgSnapshotStore, SnapshotStore};
use lockstep_core::triggers::{ToggleMode, TriggerEngine, TriggerOperation};
use lockstep_rdbc::connection::{Connection, ConnectionFactory};
use lockstep_rdbc::postgres::PgConnectionFactory;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(version, about = "Trigger and index management for live PostgreSQL replication")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "lockstep.yaml", env = "LOCKSTEP_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the capture trigger on the primary
    Triggers {
        #[command(subcommand)]
        action: TriggerCommand,
    },
    /// Drop and recreate large indexes on the secondary
    Indexes {
        #[command(subcommand)]
        action: IndexCommand,
    },
    /// Block until the replication log reports a finished copy
    WaitForCopy,
    /// Validate configuration file
    Validate,
}

#[derive(Subcommand)]
enum TriggerCommand {
    /// Create the trigger where missing
    Add,
    /// Drop the trigger where present
    Drop,
    /// Change the firing mode of existing triggers
    Toggle {
        /// Mode to switch to
        #[arg(value_enum)]
        mode: ToggleArg,
    },
    /// List tables whose trigger is not yet in place (read-only)
    Verify {
        /// Check that triggers are gone instead
        #[arg(long)]
        dropped: bool,
    },
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Create the snapshot table in the metadata database
    Install,
    /// Snapshot and drop large indexes
    Drop,
    /// Recreate every dropped index for the job
    Recreate {
        /// Wait for the copy to finish first
        #[arg(long)]
        wait: bool,
    },
    /// List indexes not yet dropped (read-only)
    Verify {
        /// Check recreated indexes instead
        #[arg(long)]
        recreated: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ToggleArg {
    Disable,
    EnableAlways,
}

impl From<ToggleArg> for ToggleMode {
    fn from(arg: ToggleArg) -> Self {
        match arg {
            ToggleArg::Disable => ToggleMode::Disable,
            ToggleArg::EnableAlways => ToggleMode::EnableAlways,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = LockstepConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let converged = match cli.command {
        Commands::Triggers { action } => run_triggers(&config, action, cli.format).await?,
        Commands::Indexes { action } => run_indexes(&config, action, cli.format).await?,
        Commands::WaitForCopy => wait_for_copy(&config).await?,
        Commands::Validate => validate_config(&config)?,
    };

    Ok(if converged {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Logs go to stderr so reports on stdout stay machine-readable.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn connect(role: &str, db: &DatabaseConfig) -> Result<Arc<dyn Connection>> {
    let conn = PgConnectionFactory
        .connect(&db.connection_config())
        .await
        .with_context(|| format!("Failed to connect to {} database", role))?;
    info!(role, "connected");
    Ok(Arc::from(conn))
}

async fn discover(catalog: &dyn ObjectCatalog, config: &LockstepConfig) -> Result<Vec<ReplicationObject>> {
    let objects = catalog
        .discover_objects(&config.replication.objects)
        .await
        .context("Failed to discover replication objects")?;
    info!(objects = objects.len(), "discovered replication objects");
    Ok(objects)
}

/// Cancelled on the first Ctrl+C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
            guard.cancel();
        }
    });
    cancel
}

fn completion_monitor(config: &LockstepConfig) -> Result<CompletionMonitor> {
    let monitor = config.monitor()?;
    let oracle = LogMarkerOracle::new(monitor.log_path.clone(), monitor.marker.clone())?;
    Ok(CompletionMonitor::new(Arc::new(oracle), monitor.poll_interval))
}

async fn run_triggers(config: &LockstepConfig, action: TriggerCommand, format: OutputFormat) -> Result<bool> {
    let conn = connect("primary", &config.databases.primary).await?;
    let catalog = Arc::new(PgCatalog::new(conn.clone()));
    let objects = discover(catalog.as_ref(), config).await?;

    let engine = TriggerEngine::new(
        catalog,
        BoundedExecutor::new(conn),
        config.trigger_spec()?,
        config.retry.timeout,
    );

    let report = match action {
        TriggerCommand::Add => engine.run(&objects, TriggerOperation::Add).await,
        TriggerCommand::Drop => engine.run(&objects, TriggerOperation::Drop).await,
        TriggerCommand::Toggle { mode } => engine.toggle(&objects, mode.into()).await,
        TriggerCommand::Verify { dropped } => {
            let operation = if dropped {
                TriggerOperation::Drop
            } else {
                TriggerOperation::Add
            };
            let pending = engine.verify(&objects, operation).await?;
            print_pending_tables(&pending, operation, format)?;
            return Ok(pending.is_empty());
        }
    };

    print_report(&report, format)?;
    Ok(report.is_converged())
}

async fn open_store(config: &LockstepConfig) -> Result<Arc<dyn SnapshotStore>> {
    let metadata = connect("metadata", config.metadata()?).await?;
    Ok(Arc::new(PgSnapshotStore::new(
        metadata,
        &config.indexes.snapshot_table,
    )?))
}

/// Manager against the secondary. Only drop reads `source`; without one the
/// target catalog stands in.
async fn index_manager(config: &LockstepConfig, source: Option<Arc<dyn ObjectCatalog>>) -> Result<IndexManager> {
    let store = open_store(config).await?;
    let secondary = connect("secondary", config.secondary()?).await?;
    let target: Arc<dyn ObjectCatalog> = Arc::new(PgCatalog::new(secondary.clone()));

    Ok(IndexManager::new(
        source.unwrap_or_else(|| target.clone()),
        target,
        BoundedExecutor::new(secondary),
        store,
        config.indexes.settings()?,
    ))
}

async fn run_indexes(config: &LockstepConfig, action: IndexCommand, format: OutputFormat) -> Result<bool> {
    let job_tag = config.replication.job_tag.as_str();

    match action {
        IndexCommand::Install => {
            let store = open_store(config).await?;
            store.install().await.context("Failed to install snapshot table")?;
            println!("✓ Snapshot table {} ready", config.indexes.snapshot_table);
            Ok(true)
        }
        IndexCommand::Drop => {
            let primary = connect("primary", &config.databases.primary).await?;
            let source: Arc<dyn ObjectCatalog> = Arc::new(PgCatalog::new(primary));
            let objects = discover(source.as_ref(), config).await?;
            let manager = index_manager(config, Some(source)).await?;
            let result = manager.drop_indexes(job_tag, &objects).await?;
            if format == OutputFormat::Json {
                print_json(&result)?;
            } else {
                for m in &result.mismatches {
                    println!(
                        "✗ {}: discovered {} eligible indexes but the snapshot holds {}",
                        m.table, m.discovered, m.stored
                    );
                }
                if result.aborted() {
                    println!("Nothing was dropped.");
                } else {
                    print_table(&result.report);
                }
            }
            Ok(result.is_converged())
        }
        IndexCommand::Recreate { wait } => {
            let result = if wait {
                let monitor = completion_monitor(config)?;
                let cancel = cancel_on_ctrl_c();
                let waited = recreate_after_copy(job_tag, &monitor, &cancel, || {
                    index_manager(config, None)
                })
                .await;
                match waited {
                    Ok(result) => result,
                    Err(e) if matches!(e.downcast_ref::<lockstep_core::Error>(), Some(lockstep_core::Error::Cancelled)) => {
                        warn!(job_tag, "wait cancelled, no index was recreated");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                index_manager(config, None).await?.recreate(job_tag).await?
            };

            if format == OutputFormat::Json {
                print_json(&result)?;
            } else {
                print_table(&result.report);
                print_records("Consumed but not live", &result.orphaned);
            }
            Ok(result.is_converged())
        }
        IndexCommand::Verify { recreated } => {
            let manager = index_manager(config, None).await?;
            let (heading, records) = if recreated {
                ("Consumed but not live", manager.verify_recreated(job_tag).await?)
            } else {
                ("Still live", manager.verify_dropped(job_tag).await?)
            };
            if format == OutputFormat::Json {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("✓ All indexes for job {} verified", job_tag);
            } else {
                print_records(heading, &records);
            }
            Ok(records.is_empty())
        }
    }
}

async fn wait_for_copy(config: &LockstepConfig) -> Result<bool> {
    let monitor = completion_monitor(config)?;
    let cancel = cancel_on_ctrl_c();

    match monitor.wait(&cancel).await? {
        WaitOutcome::Completed {
            baseline,
            observed,
            polls,
        } => {
            println!(
                "✓ Copy complete (marker count {} -> {} after {} polls)",
                baseline, observed, polls
            );
            Ok(true)
        }
        WaitOutcome::Cancelled => {
            warn!("wait cancelled before the copy completed");
            Ok(false)
        }
    }
}

fn validate_config(config: &LockstepConfig) -> Result<bool> {
    println!("✓ Configuration valid!\n");

    println!("Databases:");
    println!("  Primary: {:?}", config.databases.primary);
    match &config.databases.secondary {
        Some(db) => println!("  Secondary: {:?}", db),
        None => println!("  Secondary: (not configured)"),
    }
    match &config.databases.metadata {
        Some(db) => println!("  Metadata: {:?}", db),
        None => println!("  Metadata: (not configured)"),
    }
    println!();

    let spec = config.trigger_spec()?;
    println!("Replication:");
    println!("  Job tag: {}", config.replication.job_tag);
    println!("  Trigger: {} -> {}()", spec.name, spec.function);
    println!("  Lock wait budget: {:?}", config.retry.timeout);
    println!();

    println!("Indexes:");
    println!(
        "  Tables larger than: {} ({} bytes)",
        config.indexes.larger_than,
        config.indexes.threshold_bytes()?
    );
    println!("  Lock wait budget: {:?}", config.indexes.drop_timeout);
    println!("  Snapshot table: {}", config.indexes.snapshot_table);
    println!(
        "  Unique constraints: {}",
        if config.indexes.include_unique_constraints {
            "included"
        } else {
            "excluded"
        }
    );
    println!();

    match &config.monitor {
        Some(monitor) => {
            println!("Monitor:");
            println!("  Log: {}", monitor.log_path.display());
            println!("  Marker: {:?}", monitor.marker);
            println!("  Poll interval: {:?}", monitor.poll_interval);
        }
        None => println!("Monitor: (not configured)"),
    }

    Ok(true)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            print_table(report);
            Ok(())
        }
    }
}

fn print_table(report: &RunReport) {
    if report.is_empty() {
        println!("Nothing to do.");
        return;
    }

    let rows: Vec<[String; 5]> = report
        .entries
        .iter()
        .map(|e| {
            let outcome = match e.outcome.detail() {
                Some(detail) => format!("{}: {}", e.outcome.label(), detail),
                None => e.outcome.label().to_string(),
            };
            [
                e.object.to_string(),
                e.target.clone(),
                e.operation.to_string(),
                format!("{:?}", e.wait_budget),
                outcome,
            ]
        })
        .collect();

    let headers = ["OBJECT", "TARGET", "OPERATION", "BUDGET", "OUTCOME"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: [&str; 5]| {
        println!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {:<w3$}  {}",
            cells[0],
            cells[1],
            cells[2],
            cells[3],
            cells[4],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
        )
    };
    line(headers);
    for row in &rows {
        line([
            row[0].as_str(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_str(),
            row[4].as_str(),
        ]);
    }

    println!();
    println!("{}", report.summary());
    if report.is_converged() {
        println!("✓ Converged");
    } else if report.fatal().count() > 0 {
        error!(fatal = report.fatal().count(), "some objects need manual attention");
    } else {
        println!("Re-run to retry {} timed-out object(s)", report.timed_out().count());
    }
}

fn print_pending_tables(pending: &[QualifiedName], operation: TriggerOperation, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&pending);
    }
    if pending.is_empty() {
        println!("✓ Every table is done ({})", operation);
        return Ok(());
    }
    println!("Pending ({}):", operation);
    for table in pending {
        println!("  - {}", table);
    }
    Ok(())
}

fn print_records(heading: &str, records: &[IndexRecord]) {
    if records.is_empty() {
        return;
    }
    println!("{}:", heading);
    for record in records {
        println!("  - {} {} on {}", record.kind, record.index_name, record.table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["lockstep", "indexes", "recreate", "--wait"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Indexes {
                action: IndexCommand::Recreate { wait: true }
            }
        ));
        assert_eq!(cli.config, PathBuf::from("lockstep.yaml"));

        let cli = Cli::try_parse_from([
            "lockstep",
            "-c",
            "/etc/lockstep.yaml",
            "triggers",
            "toggle",
            "enable-always",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Triggers {
                action: TriggerCommand::Toggle {
                    mode: ToggleArg::EnableAlways
                }
            }
        ));
        assert!(cli.format == OutputFormat::Json);
    }

    #[test]
    fn test_unknown_toggle_mode_rejected() {
        assert!(Cli::try_parse_from(["lockstep", "triggers", "toggle", "replica"]).is_err());
    }
}
