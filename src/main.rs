//! mlnode - Main entry point
//!
//! Parses the command line, sets up logging and signal handling, then
//! dispatches to the requested command. Exit codes: 0 when the run completed
//! or paused for the operator, 1 on a failed step or any other error, 2 when
//! the progress file names a step this build does not know.

use std::path::Path;
use std::process::ExitCode;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mlnode::cli::{Cli, Commands};
use mlnode::config::SetupConfig;
use mlnode::error::{Result, SetupError};
use mlnode::marker::{FileMarkerStore, Marker, MarkerStore, MemoryMarkerStore};
use mlnode::process_guard;
use mlnode::sequencer::RunResult;
use mlnode::steps::{self, Platform};

/// Initialize tracing; `RUST_LOG` overrides the verbosity flag.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli);

    // Stop running tools on SIGINT/SIGTERM/SIGHUP; the marker stays put
    if let Err(e) = process_guard::install_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    match dispatch(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("✗ {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn dispatch(cli: &Cli) -> Result<u8> {
    match cli.command() {
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            let store = marker_store(cli, &config)?;
            run(config, store, cli.dry_run)
        }
        Commands::Status => status(&marker_store(cli, &load_config(cli.config.as_deref())?)?),
        Commands::Steps => list_steps(),
        Commands::Reset { yes } => {
            // A config file may relocate the progress file; --state-file wins
            let config = if cli.state_file.is_some() {
                SetupConfig::default()
            } else {
                load_config(cli.config.as_deref())?
            };
            reset(&marker_store(cli, &config)?, yes, cli.dry_run)
        }
        Commands::Config { output } => {
            SetupConfig::default().save_to_file(&output)?;
            println!("✓ Default configuration written to {}", output.display());
            Ok(0)
        }
    }
}

fn marker_store(cli: &Cli, config: &SetupConfig) -> Result<FileMarkerStore> {
    Ok(FileMarkerStore::new(
        config.resolve_marker_path(cli.state_file.as_deref())?,
    ))
}

fn load_config(path: Option<&Path>) -> Result<SetupConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SetupConfig::load_from_file(path)?
        }
        None => SetupConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run(config: SetupConfig, store: FileMarkerStore, dry_run: bool) -> Result<u8> {
    let sequence = steps::default_sequence()?;

    // Dry runs never write progress, so they neither lock nor touch the file
    let _lock = if dry_run {
        None
    } else {
        Some(store.lock()?)
    };

    let marker = store.load()?.unwrap_or(Marker::Start);
    let remaining = sequence.plan(&marker)?;
    match remaining.first() {
        Some(next) if marker.is_start() => println!("▶ Starting at step '{}'", next.name()),
        Some(next) => println!(
            "▶ Resuming at step '{}' (last completed: '{}')",
            next.name(),
            marker
        ),
        None => println!("✓ All steps already completed"),
    }

    let platform = Platform::system(config, dry_run);
    let result = if dry_run {
        info!("Dry run: mutating commands are skipped and progress is not saved");
        let mut preview = match store.load()? {
            Some(marker) => MemoryMarkerStore::with_marker(marker),
            None => MemoryMarkerStore::new(),
        };
        sequence.run(&platform, &mut preview)?
    } else {
        let mut store = store;
        sequence.run(&platform, &mut store)?
    };

    match &result {
        RunResult::Completed { executed } => {
            info!("Sequence completed ({} steps run)", executed.len());
            println!("✓ {}", steps::completion_message(&platform.config));
        }
        RunResult::Paused { step, instruction } => {
            println!("⏸ Paused at step '{}'", step);
            println!("  {}", instruction);
        }
        RunResult::Failed { step, error } => {
            error!("Step '{}' failed: {:#}", step, error);
            eprintln!("✗ Step '{}' failed: {:#}", step, error);
            eprintln!("  Fix the problem and re-run mlnode; it resumes at '{}'.", step);
        }
    }
    Ok(result.exit_code() as u8)
}

fn status(store: &FileMarkerStore) -> Result<u8> {
    let sequence = steps::default_sequence()?;
    let marker = store.load()?;

    println!("Progress file: {}", store.path().display());
    match &marker {
        None => println!("Last completed: (no progress file)"),
        Some(marker) if marker.is_start() => println!("Last completed: (none)"),
        Some(marker) => println!("Last completed: {}", marker),
    }

    let remaining = sequence.plan(&marker.unwrap_or(Marker::Start))?;
    if remaining.is_empty() {
        println!("All {} steps completed", sequence.len());
    } else {
        println!("Remaining steps ({}/{}):", remaining.len(), sequence.len());
        for step in remaining {
            println!("  {:<22} {}", step.name(), step.description());
        }
    }
    Ok(0)
}

fn list_steps() -> Result<u8> {
    let sequence = steps::default_sequence()?;
    for (index, step) in sequence.steps().iter().enumerate() {
        println!("{:>2}. {:<22} {}", index + 1, step.name(), step.description());
    }
    Ok(0)
}

fn reset(store: &FileMarkerStore, yes: bool, dry_run: bool) -> Result<u8> {
    if !yes {
        return Err(SetupError::validation(format!(
            "reset deletes {}; pass --yes to confirm",
            store.path().display()
        )));
    }
    if dry_run {
        println!("Would delete {}", store.path().display());
        return Ok(0);
    }

    let _lock = store.lock()?;
    if store.clear()? {
        println!("✓ Removed {}", store.path().display());
    } else {
        println!("No progress file at {}", store.path().display());
    }
    Ok(0)
}
