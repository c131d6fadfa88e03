//! Command-line argument definitions for the reanalysis processor
//!
//! Every command reads the YAML pipeline configuration; the options here
//! only override what a single invocation needs to change.

use crate::config::{MonthList, PipelineConfig};
use crate::constants::{APP_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::{ProcessorError, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the reanalysis processor
///
/// Converts ERA5 / CERRA reanalysis fields from the DKRZ pool into a
/// CMIP-style daily and monthly archive.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "reanalysis-processor",
    version,
    about = "Convert ERA5/CERRA reanalysis fields into a CMIP-style archive",
    long_about = "Fetches raw reanalysis fields from the DKRZ pool (or a local mirror), \
                  normalizes them, converts units, aggregates sub-daily data to daily values, \
                  regrids and chunks the result and writes daily and monthly files under CMIP \
                  variable names. Completed (variable, year, month) units are checkpointed so \
                  reruns only process what is missing."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the pipeline for every configured unit
    Process(ProcessArgs),
    /// Show the units and stage sequence a run would execute
    Plan(PlanArgs),
    /// Report checkpoint state of every configured unit
    Status(PlanArgs),
    /// List the variable catalog and conversion branches
    Variables(VariablesArgs),
}

/// Options shared by every command
#[derive(Debug, Clone, clap::Args)]
pub struct CommonArgs {
    /// Pipeline configuration file
    ///
    /// Defaults to `reanalysis-processor/config.yaml` under the platform
    /// configuration directory.
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        help = "Pipeline configuration file (YAML)"
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "Enable verbose logging (-v: debug, -vv: trace)"
    )]
    pub verbose: u8,

    #[arg(
        short = 'q',
        long = "quiet",
        help = "Only show errors",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,

    /// Also write log records to this file
    #[arg(long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl CommonArgs {
    pub fn get_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Explicit `--config` or the platform default location
    pub fn resolve_config_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config_file {
            return Ok(path.clone());
        }
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
            .ok_or_else(|| {
                ProcessorError::configuration(
                    "no configuration directory on this platform; pass --config",
                )
            })
    }
}

/// Which units of the configuration a command works on
#[derive(Debug, Clone, clap::Args)]
pub struct SelectionArgs {
    #[arg(
        long = "variables",
        value_name = "NAMES",
        value_delimiter = ',',
        help = "Comma-separated short names replacing the configured variables"
    )]
    pub variables: Vec<String>,

    #[arg(long = "start-year", value_name = "YEAR")]
    pub start_year: Option<i32>,

    #[arg(long = "end-year", value_name = "YEAR")]
    pub end_year: Option<i32>,

    /// Months to process, e.g. "01, 02, 12"
    #[arg(long = "months", value_name = "LIST")]
    pub months: Option<MonthList>,
}

impl SelectionArgs {
    /// Apply the selection overrides on top of a loaded configuration
    pub fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if !self.variables.is_empty() {
            config = config.with_variables(self.variables.iter().map(|v| v.trim().to_string()));
        }
        if let Some(start) = self.start_year {
            config.time.start_year = start;
        }
        if let Some(end) = self.end_year {
            config.time.end_year = end;
        }
        if let Some(months) = &self.months {
            config = config.with_months(months.clone());
        }
        config
    }
}

#[derive(Debug, Clone, Parser)]
pub struct ProcessArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Reprocess units even when they are already checkpointed as complete
    #[arg(long = "overwrite")]
    pub overwrite: bool,

    /// Print the plan and exit without touching any file
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    #[arg(
        short = 'j',
        long = "jobs",
        value_name = "N",
        help = "Units processed concurrently (overrides execution.max_concurrent_units)"
    )]
    pub jobs: Option<usize>,

    #[arg(long = "no-progress", help = "Disable the progress bar")]
    pub no_progress: bool,
}

impl ProcessArgs {
    pub fn validate(&self) -> Result<()> {
        if self.jobs == Some(0) {
            return Err(ProcessorError::configuration(
                "Number of jobs must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn show_progress(&self) -> bool {
        !self.common.quiet && !self.no_progress
    }

    /// Selection, flags and concurrency applied to a loaded configuration
    pub fn apply(&self, config: PipelineConfig) -> PipelineConfig {
        let mut config = self.selection.apply(config);
        if self.overwrite {
            config = config.with_overwrite(true);
        }
        if let Some(jobs) = self.jobs {
            config = config.with_max_concurrent_units(jobs);
        }
        config
    }
}

#[derive(Debug, Clone, Parser)]
pub struct PlanArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Debug, Clone, Parser)]
pub struct VariablesArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Extra catalog file in `ERA5_variables.json` format
    #[arg(long = "catalog", value_name = "FILE")]
    pub catalog: Option<PathBuf>,
}
