//! Command implementations for the reanalysis processor CLI

use crate::catalog::VariableCatalog;
use crate::checkpoint::{CheckpointState, CheckpointStore, FileCheckpointStore};
use crate::cli::args::{Args, Commands, CommonArgs, PlanArgs, ProcessArgs, VariablesArgs};
use crate::config::PipelineConfig;
use crate::conversion::{ConversionPlan, ConversionTable};
use crate::models::Frequency;
use crate::processor::PipelineEngine;
use crate::processor::driver::{RunDriver, enumerate_units, print_summary};

use anyhow::{Context, bail};
use chrono::Utc;
use colored::*;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Dispatch the parsed command line
pub async fn run(args: Args, cancel: CancellationToken) -> anyhow::Result<()> {
    match args.command {
        Some(Commands::Process(process_args)) => run_process(process_args, cancel).await,
        Some(Commands::Plan(plan_args)) => run_plan(plan_args),
        Some(Commands::Status(status_args)) => run_status(status_args),
        Some(Commands::Variables(variables_args)) => run_variables(variables_args),
        None => Ok(()),
    }
}

/// Drive `work` to completion, cancelling `cancel` once `shutdown` resolves.
///
/// After shutdown `work` is still awaited so in-flight units remove their
/// partial artifacts before the process exits.
pub async fn run_until_shutdown<W, S>(
    work: W,
    shutdown: S,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    W: Future<Output = anyhow::Result<()>>,
    S: Future<Output = ()>,
{
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => return result,
        _ = shutdown => {
            eprintln!("\nReceived CTRL+C, cleaning up in-flight units...");
            cancel.cancel();
        }
    }
    work.await.context("Processing interrupted by user")
}

/// Install the tracing subscriber: stderr always, plus an optional log file
pub fn setup_logging(common: &CommonArgs) -> anyhow::Result<()> {
    let log_level = common.get_log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("reanalysis_processor={}", log_level)));

    let file_layer = match &common.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(())
}

/// Parse the configuration file named by `common` without validating it
fn read_config(common: &CommonArgs) -> anyhow::Result<PipelineConfig> {
    let path = common.resolve_config_path()?;
    info!("Using configuration {}", path.display());
    Ok(PipelineConfig::read(&path)?)
}

async fn run_process(args: ProcessArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    setup_logging(&args.common)?;
    args.validate()?;

    let config = args.apply(read_config(&args.common)?);
    config.validate()?;

    if args.dry_run {
        return print_plan(&config);
    }

    println!("{}", "Starting reanalysis processing".bright_green().bold());
    println!(
        "  {} {} ({:?} store)",
        "Source:".bright_cyan(),
        config.paths.origin.display(),
        config.dataset.store
    );
    println!(
        "  {} {}",
        "Archive:".bright_cyan(),
        config.paths.proc.display()
    );
    println!(
        "  {} {}",
        "Variables:".bright_cyan(),
        config.variables.join(", ").bright_white()
    );
    println!(
        "  {} {}-{} ({})",
        "Period:".bright_cyan(),
        config.time.start_year,
        config.time.end_year,
        config
            .time
            .months
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "all months".to_string())
    );

    let config = Arc::new(config);
    let engine = PipelineEngine::from_config(config).context("Failed to initialize pipeline")?;
    let driver = RunDriver::new(Arc::new(engine)).with_progress(args.show_progress());

    let summary = driver.run(&cancel).await?;
    print_summary(&summary);

    if summary.units_failed() > 0 {
        bail!(
            "{} unit(s) failed; rerun to retry them",
            summary.units_failed()
        );
    }
    Ok(())
}

fn run_plan(args: PlanArgs) -> anyhow::Result<()> {
    setup_logging(&args.common)?;
    let config = args.selection.apply(read_config(&args.common)?);
    config.validate()?;
    print_plan(&config)
}

/// Units and stage sequence of a run, without side effects
fn print_plan(config: &PipelineConfig) -> anyhow::Result<()> {
    let catalog = config.load_catalog()?;
    let table = config.conversion_table();
    let layout = config.layout();
    let units = enumerate_units(config, &catalog, &layout, Utc::now().date_naive())?;

    println!("{}", "Processing Plan".bright_green().bold());
    println!("  {} {}", "Units:".bright_cyan(), units.len());

    let mut current: Option<&str> = None;
    for unit in &units {
        let short_name = unit.variable.short_name.as_str();
        if current != Some(short_name) {
            current = Some(short_name);
            match ConversionPlan::resolve(&unit.variable, &catalog, &table) {
                Ok(plan) => println!(
                    "\n  {} -> {}  {}",
                    short_name.bright_white().bold(),
                    unit.variable.cmip_name.bright_white(),
                    plan.describe().dimmed()
                ),
                Err(e) => println!(
                    "\n  {} {}",
                    short_name.bright_white().bold(),
                    e.to_string().red()
                ),
            }
        }
        println!("    {}", unit.archive_path.display());
    }
    Ok(())
}

fn run_status(args: PlanArgs) -> anyhow::Result<()> {
    setup_logging(&args.common)?;
    let config = args.selection.apply(read_config(&args.common)?);
    config.validate()?;

    let catalog = config.load_catalog()?;
    let layout = config.layout();
    let units = enumerate_units(&config, &catalog, &layout, Utc::now().date_naive())?;
    let store = FileCheckpointStore::new(config.checkpoint_dir(), config.stale_lock_after())?;

    let (mut completed, mut started, mut pending) = (0usize, 0usize, 0usize);
    println!("{}", "Checkpoint Status".bright_green().bold());
    for unit in &units {
        let label = match store.state(&unit.checkpoint_key())? {
            Some(CheckpointState::Completed) if unit.archive_path.is_file() => {
                completed += 1;
                "completed".green()
            }
            Some(CheckpointState::Completed) => {
                pending += 1;
                "archive missing".yellow()
            }
            Some(CheckpointState::Started) => {
                started += 1;
                "started".yellow()
            }
            None => {
                pending += 1;
                "pending".dimmed()
            }
        };
        println!("  {:<20} {}", unit.to_string(), label);
    }

    println!();
    println!(
        "  {} {}",
        "Completed:".bright_cyan(),
        completed.to_string().bright_white().bold()
    );
    println!("  {} {}", "Started:".bright_cyan(), started);
    println!("  {} {}", "Pending:".bright_cyan(), pending);
    println!(
        "  {} {}",
        "Archive files:".bright_cyan(),
        count_archive_files(&config.paths.proc, layout.extension())
    );
    Ok(())
}

/// Count files with `extension` anywhere below the archive root
fn count_archive_files(root: &Path, extension: &str) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == extension))
        .count()
}

fn run_variables(args: VariablesArgs) -> anyhow::Result<()> {
    setup_logging(&args.common)?;

    // A missing default config is fine here: the built-in tables are listed
    let (mut catalog, table) = match args.common.resolve_config_path() {
        Ok(path) if path.is_file() => {
            let config = PipelineConfig::read(&path)?;
            (config.load_catalog()?, config.conversion_table())
        }
        _ => {
            debug!("No configuration file, listing built-in variables");
            (VariableCatalog::builtin(), ConversionTable::builtin())
        }
    };
    if let Some(path) = &args.catalog {
        catalog.extend(VariableCatalog::from_json_file(path)?);
    }

    println!(
        "{} ({})",
        "Variable Catalog".bright_green().bold(),
        catalog.len()
    );
    println!(
        "  {:<8} {:<8} {:<12} {:<8} {:<10} {}",
        "short", "cmip", "unit", "param", "frequency", "conversion"
    );
    for name in catalog.names() {
        let descriptor = catalog.lookup(name)?;
        let frequency = match descriptor.frequency {
            Frequency::Daily => "daily",
            Frequency::Hourly => "hourly",
            Frequency::ThreeHourly => "3-hourly",
        };
        let conversion = match table.resolve(descriptor) {
            Ok(conversion) => conversion.to_string().normal(),
            Err(_) => "unsupported".red(),
        };
        println!(
            "  {:<8} {:<8} {:<12} {:<8} {:<10} {}",
            descriptor.short_name.bright_white(),
            descriptor.cmip_name,
            format!("{} -> {}", descriptor.native_unit, descriptor.cmip_unit),
            descriptor.source_param_id,
            frequency,
            conversion
        );
    }
    Ok(())
}
