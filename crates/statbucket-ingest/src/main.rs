//! Statbucket ingest CLI - Main entry point

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use statbucket_common::logging::{init_logging, LogConfig, LogLevel};
use statbucket_common::ValueKind;
use statbucket_ingest::config::IngestConfig;
use statbucket_ingest::pipeline::{
    CachingFetcher, DatasetPipeline, Fetcher, HttpFetcher, Orchestrator, PersistTarget, PipelineSettings, RunOptions,
    RunStatus,
};
use statbucket_ingest::schema::ChangeKind;
use statbucket_ingest::state::StateFile;
use statbucket_ingest::store::{MemoryStore, RelationalStore};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Statbucket - schema-drift aware sports stats ingestion
#[derive(Parser, Debug)]
#[command(name = "statbucket-ingest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./statbucket.toml when present)
    #[arg(short, long, global = true, env = "STATBUCKET_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Fetch pages again even when the page cache has them
    #[arg(long, global = true)]
    refresh: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a dataset, skipping units that are already done
    Run {
        #[arg(required_unless_present = "all")]
        dataset: Option<String>,
        /// Run every enabled dataset in dependency order
        #[arg(long, conflicts_with = "dataset")]
        all: bool,
        /// Reprocess done units
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value_t = PersistTarget::Intermediate)]
        target: PersistTarget,
        /// Restrict the run to these units (repeatable)
        #[arg(long = "unit")]
        units: Vec<String>,
    },

    /// Continue a halted dataset after its changes were reviewed
    Resume {
        dataset: String,
        #[arg(long, value_enum, default_value_t = PersistTarget::Intermediate)]
        target: PersistTarget,
    },

    /// Return a unit to pending so the next run reprocesses it
    Reset { dataset: String, unit: String },

    /// Review detected schema changes
    Changes {
        #[command(subcommand)]
        command: ChangesCommand,
    },

    /// Manage migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },

    /// Show checkpoints and current schema versions
    Status { dataset: Option<String> },
}

#[derive(Subcommand, Debug)]
enum ChangesCommand {
    /// List schema changes (pending only unless --all)
    List {
        dataset: Option<String>,
        #[arg(long)]
        all: bool,
    },
    Approve { id: u64 },
    Reject { id: u64 },
    /// Record an approved column rename
    Rename { dataset: String, column: String, to: String },
    /// Record an approved column retype
    Retype {
        dataset: String,
        column: String,
        from: ValueKind,
        to: ValueKind,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    /// Bundle approved changes into a migration
    Create {
        dataset: String,
        #[arg(required = true)]
        changes: Vec<u64>,
    },
    Apply {
        id: u64,
        /// Report the planned changes and check the backfill without writing
        #[arg(long)]
        dry_run: bool,
    },
    Rollback { id: u64 },
    List { dataset: Option<String> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::for_binary("statbucket-ingest")
        .with_level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info });
    // Environment variables take precedence over the flags
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Warning: ignoring logging environment: {}", e);
            log_config
        },
    };
    let log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {}", e);
            None
        },
    };

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        drop(log_guard);
        process::exit(1);
    }
}

/// The relational store, plus the in-memory store when it has to be saved on exit
async fn build_store(config: &IngestConfig) -> anyhow::Result<(Arc<dyn RelationalStore>, Option<Arc<MemoryStore>>)> {
    #[cfg(feature = "database")]
    if let Some(url) = &config.database_url {
        let store = statbucket_ingest::store::PostgresStore::connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        info!("Using PostgreSQL store");
        return Ok((Arc::new(store), None));
    }

    #[cfg(not(feature = "database"))]
    if config.database_url.is_some() {
        warn!("database_url is set but this build has no `database` feature");
    }

    let path = config.memory_tables_path();
    let store = Arc::new(MemoryStore::load(&path).context("Failed to load in-memory tables")?);
    warn!(path = %path.display(), "No database configured; tables are kept in a local file");
    Ok((store.clone(), Some(store)))
}

fn build_fetcher(config: &IngestConfig, refresh: bool) -> anyhow::Result<Arc<dyn Fetcher>> {
    let http = HttpFetcher::new(config.http.timeout(), &config.http.user_agent, config.http.request_delay())
        .context("Failed to build HTTP fetcher")?;
    Ok(match &config.http.cache_dir {
        Some(dir) => {
            info!(dir = %dir.display(), refresh, "Caching fetched pages");
            Arc::new(CachingFetcher::new(Arc::new(http), dir, config.http.cache_max_age()).refresh(refresh))
        },
        None => Arc::new(http),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = IngestConfig::load(cli.config.as_deref())?;
    info!(datasets = config.datasets.len(), state = %config.state_path.display(), "Loaded configuration");
    let state_file = StateFile::new(&config.state_path);
    let state = state_file.load()?;

    let fetcher = build_fetcher(&config, cli.refresh)?;
    let (store, memory) = build_store(&config).await?;
    let mut orchestrator = Orchestrator::with_state(fetcher, store, PipelineSettings::from_config(&config), state);
    for definition in &config.datasets {
        let pipeline = DatasetPipeline::from_definition(definition.clone())
            .with_context(|| format!("Invalid dataset '{}'", definition.name))?;
        orchestrator.register(pipeline);
    }

    let outcome = dispatch(&cli.command, &config, &orchestrator).await;

    // Progress made before a failure is still worth keeping.
    state_file
        .save(&orchestrator.state().await)
        .context("Failed to save state")?;
    if let Some(memory) = memory {
        memory
            .save(&config.memory_tables_path())
            .context("Failed to save in-memory tables")?;
    }
    outcome
}

async fn dispatch(command: &Commands, config: &IngestConfig, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            dataset,
            all,
            force,
            target,
            units,
        } => {
            let options = RunOptions {
                force: *force,
                target: *target,
                units: (!units.is_empty()).then(|| units.clone()),
            };
            match dataset {
                Some(dataset) if !*all => run_dataset(orchestrator, dataset, options).await,
                _ => run_all(orchestrator, options).await,
            }
        },

        Commands::Resume { dataset, target } => {
            let pending = orchestrator.changes(Some(dataset), true).await;
            if !pending.is_empty() {
                warn!(dataset = %dataset, pending = pending.len(), "Dataset still has pending schema changes");
            }
            let options = RunOptions {
                target: *target,
                ..Default::default()
            };
            run_dataset(orchestrator, dataset, options).await
        },

        Commands::Reset { dataset, unit } => {
            orchestrator.reset(dataset, unit).await?;
            println!("Reset {}/{} to pending", dataset, unit);
            Ok(())
        },

        Commands::Changes { command } => match command {
            ChangesCommand::List { dataset, all } => {
                print_json(&orchestrator.changes(dataset.as_deref(), !*all).await)
            },
            ChangesCommand::Approve { id } => print_json(&orchestrator.approve_change(*id).await?),
            ChangesCommand::Reject { id } => print_json(&orchestrator.reject_change(*id).await?),
            ChangesCommand::Rename { dataset, column, to } => {
                let id = orchestrator
                    .record_change(dataset, column, ChangeKind::Rename { to: to.clone() })
                    .await?;
                println!("Recorded change {}", id);
                Ok(())
            },
            ChangesCommand::Retype {
                dataset,
                column,
                from,
                to,
            } => {
                let id = orchestrator
                    .record_change(dataset, column, ChangeKind::Retype { from: *from, to: *to })
                    .await?;
                println!("Recorded change {}", id);
                Ok(())
            },
        },

        Commands::Migrate { command } => match command {
            MigrateCommand::Create { dataset, changes } => {
                let id = orchestrator.create_migration(dataset, changes, None, None).await?;
                println!("Created migration {}", id);
                Ok(())
            },
            MigrateCommand::Apply { id, dry_run: true } => print_json(&orchestrator.dry_run_migration(*id).await?),
            MigrateCommand::Apply { id, dry_run: false } => print_json(&orchestrator.apply_migration(*id).await?),
            MigrateCommand::Rollback { id } => print_json(&orchestrator.rollback_migration(*id).await?),
            MigrateCommand::List { dataset } => print_json(&orchestrator.migrations(dataset.as_deref()).await),
        },

        Commands::Status { dataset } => {
            let names: Vec<String> = match dataset {
                Some(name) => vec![name.clone()],
                None => config.datasets.iter().map(|d| d.name.clone()).collect(),
            };
            for name in names {
                let version = orchestrator.snapshot(&name).await.map(|s| s.version);
                println!("{} (schema version {})", name, version.map_or("-".to_string(), |v| v.to_string()));
                for cp in orchestrator.checkpoints(&name).await {
                    println!(
                        "  {:<12} {:<11} attempts={} rows={}{}",
                        cp.source_unit,
                        cp.status,
                        cp.attempts,
                        cp.rows_persisted,
                        cp.last_error.map(|e| format!(" error={}", e)).unwrap_or_default()
                    );
                }
            }
            Ok(())
        },
    }
}

/// Cancellation token tripped by Ctrl-C
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current unit");
            on_signal.cancel();
        }
    });
    cancel
}

async fn run_all(orchestrator: &Orchestrator, options: RunOptions) -> anyhow::Result<()> {
    let reports = orchestrator.run_all(options, interrupt_token()).await?;
    print_json(&reports)?;
    if let Some(last) = reports.last().filter(|r| r.status != RunStatus::Completed) {
        anyhow::bail!("Dataset '{}' finished {}; later datasets were not run", last.dataset, last.status);
    }
    Ok(())
}

async fn run_dataset(orchestrator: &Orchestrator, dataset: &str, options: RunOptions) -> anyhow::Result<()> {
    let report = orchestrator.run(dataset, options, interrupt_token()).await?;
    print_json(&report)?;
    if let Some(halt) = &report.halt {
        anyhow::bail!(
            "{}; review with `statbucket-ingest changes list {}`",
            halt,
            dataset
        );
    }
    Ok(())
}
