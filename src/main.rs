//! Unreal Builder - queued packaging of Unreal Engine plugins and projects
//!
//! Command-line front end over the build orchestration core.
//!
//! # Commands
//!
//! - `scan`: Probe the registry and common install roots for engines and
//!   register the new ones
//! - `validate <path>`: Check that a directory is a usable engine installation
//! - `list`: Show registered engines, projects and profiles
//! - `build <project-id>...`: Queue builds and stream their output; Ctrl-C
//!   cancels whichever build is running
//! - `history`: Show recent builds and analytics
//!
//! # Configuration
//!
//! Runtime settings come from `unreal-builder.{toml,yaml,json}` (or `--settings`)
//! and `UEB_*` environment variables; see [`RuntimeSettings`].

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use unreal_builder::logging::{LogOptions, setup_logging};
use unreal_builder::services::engine_locator::{
    EngineLocator, detect_version, merge_scanned_engines, validate_engine_installation,
};
use unreal_builder::services::{TokioProcessRunner, entry_script_path};
use unreal_builder::{
    APP_NAME, BuildEvent, BuildStatus, ConfigStore, QueueCoordinator, RuntimeSettings, VERSION,
};

#[derive(Debug, Parser)]
#[command(name = "unreal-builder", version, about = "Queue and run Unreal Engine packaging builds")]
struct Cli {
    /// Runtime settings file (toml, yaml or json)
    #[arg(long, global = true)]
    settings: Option<Utf8PathBuf>,

    /// Use this data file instead of the configured one
    #[arg(long, global = true)]
    data_file: Option<Utf8PathBuf>,

    /// Enable debug logging and mirror logs to stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Find engine installations and register new ones
    Scan {
        /// Report what was found without saving
        #[arg(long)]
        dry_run: bool,
    },

    /// Check whether a directory is a valid engine installation
    Validate { path: Utf8PathBuf },

    /// List registered engines, projects and profiles
    List,

    /// Queue one or more builds and wait for them to finish
    Build {
        #[arg(required = true)]
        project_ids: Vec<String>,

        /// Apply this profile instead of each project's default
        #[arg(long)]
        profile: Option<String>,
    },

    /// Show build history and analytics
    History {
        /// Number of records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Remove all finished records
        #[arg(long)]
        clear: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut settings = RuntimeSettings::load(cli.settings.as_deref())?;
    if let Some(data_file) = &cli.data_file {
        settings.data_file = data_file.clone();
    }

    let _guard = setup_logging(
        &settings.log_dir,
        APP_NAME,
        LogOptions {
            debug: settings.debug || cli.debug,
            console: settings.console_log || cli.debug,
            json: settings.json_log,
        },
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("unreal-builder-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let store = ConfigStore::new(&settings.data_file);
    let result = runtime.block_on(run(cli.command, store));

    tracing::info!("Shutdown complete");
    result
}

async fn run(command: Commands, store: ConfigStore) -> Result<ExitCode> {
    match command {
        Commands::Scan { dry_run } => scan(store, dry_run).await,
        Commands::Validate { path } => Ok(validate(path)),
        Commands::List => {
            list(&store);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Build {
            project_ids,
            profile,
        } => build(store, project_ids, profile).await,
        Commands::History { limit, clear } => history(&store, limit, clear),
    }
}

async fn scan(store: ConfigStore, dry_run: bool) -> Result<ExitCode> {
    let found = EngineLocator::for_current_platform().scan().await;
    for engine in &found {
        println!("{:<8} {:<9} {}", engine.version, format!("{:?}", engine.origin), engine.path);
    }

    if dry_run {
        println!("{} installation(s) found", found.len());
        return Ok(ExitCode::SUCCESS);
    }

    let added = store
        .update(|config| merge_scanned_engines(config, found))
        .context("Failed to save scanned engines")?;
    println!("{} new installation(s) registered in {}", added, store.path());
    Ok(ExitCode::SUCCESS)
}

fn validate(path: Utf8PathBuf) -> ExitCode {
    if validate_engine_installation(&path) {
        println!("Valid: Unreal Engine {} at {}", detect_version(&path), path);
        ExitCode::SUCCESS
    } else {
        println!("Invalid: {} not found", entry_script_path(&path));
        ExitCode::FAILURE
    }
}

fn list(store: &ConfigStore) {
    let config = store.load();

    println!("Engines:");
    for engine in &config.engines {
        let flag = if engine.validated { "" } else { " (unvalidated)" };
        println!("  {}  {} {}{}", engine.id, engine.version, engine.path, flag);
    }

    println!("Projects:");
    for project in &config.projects {
        println!(
            "  {}  {} [{}] {}",
            project.id,
            project.name,
            project.artifact_kind,
            project.target_platforms.join("+")
        );
    }

    println!("Profiles:");
    for profile in &config.profiles {
        println!("  {}  {} [{}]", profile.id, profile.name, profile.artifact_kind);
    }
}

async fn build(
    store: ConfigStore,
    project_ids: Vec<String>,
    profile: Option<String>,
) -> Result<ExitCode> {
    let coordinator = QueueCoordinator::spawn(store, Arc::new(TokioProcessRunner::new()));
    let mut events = coordinator.subscribe();

    let mut pending = HashSet::new();
    for project_id in project_ids {
        let build_id = match &profile {
            Some(profile_id) => {
                coordinator
                    .enqueue_build_with_profile(&project_id, profile_id)
                    .await?
            }
            None => coordinator.enqueue_build(&project_id).await?,
        };
        println!("Queued build {} for project {}", build_id, project_id);
        pending.insert(build_id);
    }

    let mut failures = 0;
    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Some(BuildEvent::Log { chunk, .. }) => print!("{}", chunk),
                Some(BuildEvent::Started { build_id }) => {
                    tracing::debug!("Build {} started", build_id)
                }
                Some(BuildEvent::Completed { build_id, success }) => {
                    if pending.remove(&build_id) && !success {
                        failures += 1;
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if coordinator.cancel_active_build().await {
                    eprintln!("Cancelling the running build...");
                } else {
                    eprintln!("No build is running");
                }
            }
        }
    }

    coordinator.shutdown().await;

    if failures > 0 {
        eprintln!("{} build(s) failed", failures);
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn history(store: &ConfigStore, limit: usize, clear: bool) -> Result<ExitCode> {
    if clear {
        store
            .update(|config| config.clear_completed_history())
            .context("Failed to clear history")?;
        println!("Cleared finished builds");
    }

    let config = store.load();
    let mut records: Vec<_> = config.build_history.iter().collect();
    records.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    for record in records.into_iter().take(limit) {
        let project = config
            .project(&record.project_id)
            .map(|p| p.name.as_str())
            .unwrap_or("<deleted project>");
        let duration = match record.duration() {
            Some(d) if record.status != BuildStatus::Queued => format!("{:.1}s", d.as_secs_f64()),
            _ => "-".to_string(),
        };
        println!(
            "{}  {:<8}  {:<24}  {}  {}",
            record.start_time.format("%Y-%m-%d %H:%M:%S"),
            record.status,
            project,
            duration,
            record.id
        );
    }

    let analytics = &config.analytics;
    println!(
        "\n{} builds, {} succeeded, {} failed ({:.0}% success), average {:.1}s",
        analytics.total_builds,
        analytics.successful_builds,
        analytics.failed_builds,
        analytics.success_rate() * 100.0,
        analytics.average_build_time
    );
    for (platform, stats) in &analytics.platform_stats {
        println!(
            "  {:<12} {} builds, {} succeeded, average {:.1}s",
            platform, stats.total, stats.success, stats.avg_time
        );
    }

    Ok(ExitCode::SUCCESS)
}
