//! Run-level orchestration: enumerate work units from the configuration,
//! drive them through the engine and summarize the outcome.

use super::PipelineEngine;
use crate::catalog::VariableCatalog;
use crate::config::PipelineConfig;
use crate::error::{ProcessorError, Result};
use crate::layout::ArchiveLayout;
use crate::models::{RunSummary, WorkUnit};

use chrono::{NaiveDate, Utc};
use colored::*;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct RunDriver {
    engine: Arc<PipelineEngine>,
    show_progress: bool,
}

impl RunDriver {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self {
            engine,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn plan_units(&self) -> Result<Vec<WorkUnit>> {
        enumerate_units(
            self.engine.config(),
            self.engine.catalog(),
            self.engine.layout(),
            Utc::now().date_naive(),
        )
    }

    /// Process every unit; local failures are collected, fatal ones stop the run
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let start_time = Instant::now();
        let units = self.plan_units()?;
        let concurrency = self.engine.config().execution.max_concurrent_units.max(1);
        info!(
            "Running {} units with up to {} in parallel",
            units.len(),
            concurrency
        );

        let progress = self.progress_bar(units.len() as u64);
        let mut summary = RunSummary::default();
        let mut fatal: Option<ProcessorError> = None;

        let engine = self.engine.as_ref();
        let mut results = stream::iter(units)
            .map(|unit| {
                let cancel = cancel.clone();
                async move {
                    // Units not yet started once the run is stopping are left untouched
                    if cancel.is_cancelled() {
                        return (unit, None);
                    }
                    let result = engine.process(&unit, &cancel).await;
                    (unit, Some(result))
                }
            })
            .buffer_unordered(concurrency);

        // In-flight units are drained after a fatal error so each one cleans up
        while let Some((unit, result)) = results.next().await {
            let Some(result) = result else {
                continue;
            };
            progress.inc(1);
            progress.set_message(unit.to_string());
            summary.record(&unit, &result);

            if let Err(e) = result {
                if e.is_fatal() && fatal.is_none() {
                    error!("Stopping run after {}: {}", unit, e);
                    cancel.cancel();
                    fatal = Some(e);
                }
            }
        }
        progress.finish_and_clear();

        summary.processing_time_ms = start_time.elapsed().as_millis();
        match fatal {
            Some(e) => {
                print_summary(&summary);
                Err(e)
            }
            None => Ok(summary),
        }
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

/// Every (variable, year, month) unit of the run in processing order.
///
/// Months after `today` are left out. An unknown variable stops the run
/// before any unit is processed.
pub fn enumerate_units(
    config: &PipelineConfig,
    catalog: &VariableCatalog,
    layout: &ArchiveLayout,
    today: NaiveDate,
) -> Result<Vec<WorkUnit>> {
    let descriptors = config
        .variables
        .iter()
        .map(|name| catalog.lookup(name).cloned())
        .collect::<Result<Vec<_>>>()?;

    let months = config.months();
    let mut units = Vec::new();
    for variable in descriptors {
        for year in config.years() {
            for &month in &months {
                let unit = WorkUnit::new(variable.clone(), year, month, layout)?;
                if unit.is_after(today) {
                    debug!("Skipping future unit {}", unit);
                    continue;
                }
                units.push(unit);
            }
        }
    }
    Ok(units)
}

pub fn print_summary(summary: &RunSummary) {
    println!("\n{}", "Processing Summary".bright_green().bold());
    println!(
        "  {} {}ms",
        "Time elapsed:".bright_cyan(),
        summary.processing_time_ms.to_string().bright_white()
    );
    println!(
        "  {} {}",
        "Units completed:".bright_cyan(),
        summary.units_completed.to_string().bright_white().bold()
    );
    println!(
        "  {} {}",
        "Already complete:".bright_cyan(),
        summary.units_already_complete.to_string().bright_white()
    );
    if summary.units_skipped > 0 {
        println!(
            "  {} {}",
            "Skipped (partial):".bright_yellow(),
            summary.units_skipped.to_string().bright_yellow()
        );
    }
    if summary.units_failed() > 0 {
        println!(
            "  {} {}",
            "Units failed:".bright_red(),
            summary.units_failed().to_string().bright_red().bold()
        );
        for (unit, reason) in &summary.failures {
            println!("    {} {}", unit.bright_white(), reason.red());
        }
    }
}
