//! Per-unit normalization engine.
//!
//! Drives one (variable, year, month) unit through its conversion plan:
//! fetch, format normalization, unit conversion (or field derivation),
//! sub-daily aggregation, integrity checks, regridding with chunked layout,
//! renaming into the archive and the monthly mean. Checkpoints make the
//! engine idempotent across runs; the work directory of a unit is private
//! to it and removed once the unit finishes.

pub mod aggregation;
pub mod artifacts;
pub mod driver;

#[cfg(test)]
pub mod tests;

use self::aggregation::AggregationScheduler;
use self::artifacts::{ArtifactLedger, remove_artifact};

use crate::catalog::VariableCatalog;
use crate::checkpoint::{CheckpointKey, CheckpointLease, CheckpointState, CheckpointStore, FileCheckpointStore};
use crate::command::{CommandRunner, TokioCommandRunner};
use crate::config::{Backend, PipelineConfig, StoreKind};
use crate::conversion::{ConversionPlan, ConversionTable, UnitConversion};
use crate::error::{ProcessorError, Result};
use crate::fetcher::{FetchRequest, Fetcher, MirrorFetcher, RsyncFetcher};
use crate::layout::ArchiveLayout;
use crate::models::{Frequency, Granularity, Reducer, SourceFamily, UnitOutcome, WorkUnit};
use crate::transcoder::{CdoTranscoder, FieldShape, FrameTranscoder, TimeBucket, Transcoder};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs the stage sequence of single work units
pub struct PipelineEngine {
    config: Arc<PipelineConfig>,
    catalog: Arc<VariableCatalog>,
    table: Arc<ConversionTable>,
    fetcher: Arc<dyn Fetcher>,
    transcoder: Arc<dyn Transcoder>,
    checkpoints: Arc<dyn CheckpointStore>,
    layout: ArchiveLayout,
}

impl PipelineEngine {
    pub fn new(
        config: Arc<PipelineConfig>,
        catalog: Arc<VariableCatalog>,
        table: Arc<ConversionTable>,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Arc<dyn Transcoder>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let layout = ArchiveLayout::new(
            &config.paths.download,
            &config.paths.work,
            &config.paths.proc,
            config.dataset.source,
            transcoder.extension(),
        );
        Self {
            config,
            catalog,
            table,
            fetcher,
            transcoder,
            checkpoints,
            layout,
        }
    }

    /// Engine wired with the backends named in the configuration
    pub fn from_config(config: Arc<PipelineConfig>) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new(config.stage_timeout()));

        let fetcher: Arc<dyn Fetcher> = match config.dataset.store {
            StoreKind::Dkrz => Arc::new(RsyncFetcher::new(
                runner.clone(),
                config.execution.rsync_host.clone(),
                config.paths.origin.clone(),
            )),
            StoreKind::Mirror => Arc::new(MirrorFetcher::new(config.paths.origin.clone())),
        };
        let transcoder: Arc<dyn Transcoder> = match config.execution.backend {
            Backend::Cdo => Arc::new(CdoTranscoder::new(runner)),
            Backend::Frame => Arc::new(FrameTranscoder::new()),
        };
        let checkpoints = Arc::new(FileCheckpointStore::new(
            config.checkpoint_dir(),
            config.stale_lock_after(),
        )?);

        let catalog = Arc::new(config.load_catalog()?);
        let table = Arc::new(config.conversion_table());
        Ok(Self::new(config, catalog, table, fetcher, transcoder, checkpoints))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &VariableCatalog {
        &self.catalog
    }

    pub fn table(&self) -> &ConversionTable {
        &self.table
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }

    /// Monthly-mean archive path of `unit`
    pub fn monthly_path(&self, unit: &WorkUnit) -> PathBuf {
        self.layout
            .archive_path(&unit.variable.cmip_name, Granularity::Mon, unit.year, unit.month)
    }

    /// Process one monthly work unit
    pub async fn process(&self, unit: &WorkUnit, cancel: &CancellationToken) -> Result<UnitOutcome> {
        if unit.is_sub_daily_step() {
            return Err(ProcessorError::InvalidWorkUnit {
                year: unit.year,
                month: unit.month,
                reason: "sub-daily steps are driven by their monthly unit".to_string(),
            });
        }

        // Resolve before any side effect
        let plan = ConversionPlan::resolve(&unit.variable, &self.catalog, &self.table)?;
        let key = unit.checkpoint_key();

        if let Some(outcome) = self.existing_outcome(unit, &key)? {
            return Ok(outcome);
        }

        let _lease = CheckpointLease::acquire(self.checkpoints.as_ref(), &key)?;
        if let Some(outcome) = self.existing_outcome(unit, &key)? {
            return Ok(outcome);
        }

        // Drops stale Completed markers as well as the overwrite case
        self.checkpoints.clear(&key)?;
        self.checkpoints.mark_started(&key)?;

        let start_time = Instant::now();
        let monthly = self.monthly_path(unit);
        info!("Processing {} [{}]", unit, plan.describe());

        // A unit whose completion cannot be recorded is cleaned up like a failed one
        let result = self
            .run_stages(unit, &plan, &monthly, cancel)
            .await
            .and_then(|fetched| {
                self.checkpoints.mark_completed(&key)?;
                Ok(fetched)
            });

        match result {
            Ok(fetched) => {
                self.remove_work_dir(unit).await;
                if self.config.cleanup.remove_sources {
                    for path in fetched {
                        if let Err(e) = fs::remove_file(&path).await {
                            warn!("Failed to remove source {}: {}", path.display(), e);
                        }
                    }
                }
                info!(
                    "Completed {} in {}ms -> {}",
                    unit,
                    start_time.elapsed().as_millis(),
                    unit.archive_path.display()
                );
                Ok(UnitOutcome::Completed {
                    archive: unit.archive_path.clone(),
                    monthly,
                })
            }
            Err(e) => {
                for path in [&unit.archive_path, &monthly] {
                    remove_artifact(self.transcoder.as_ref(), path).await;
                }

                let diagnosable = matches!(
                    e,
                    ProcessorError::StageFailure { .. } | ProcessorError::IntegrityMismatch { .. }
                );
                if diagnosable && self.config.cleanup.keep_failed_intermediates {
                    warn!(
                        "Keeping intermediates of {} in {}",
                        unit,
                        unit.working_path.display()
                    );
                } else {
                    self.remove_work_dir(unit).await;
                }

                error!("Failed {}: {}", unit, e);
                Err(e)
            }
        }
    }

    /// Outcome when the checkpoint makes running the unit unnecessary
    fn existing_outcome(&self, unit: &WorkUnit, key: &CheckpointKey) -> Result<Option<UnitOutcome>> {
        if self.config.flags.overwrite {
            return Ok(None);
        }

        match self.checkpoints.state(key)? {
            Some(CheckpointState::Completed) => {
                if unit.archive_path.is_file() {
                    debug!("{} already complete", unit);
                    return Ok(Some(UnitOutcome::AlreadyComplete {
                        archive: unit.archive_path.clone(),
                    }));
                }
                warn!(
                    "Completed marker for {} without archive {}, reprocessing",
                    unit,
                    unit.archive_path.display()
                );
                Ok(None)
            }
            Some(CheckpointState::Started) if !self.config.checkpoint.resume_partial => {
                info!("Skipping partially processed {}", unit);
                Ok(Some(UnitOutcome::SkippedPartial))
            }
            _ => Ok(None),
        }
    }

    async fn run_stages(
        &self,
        unit: &WorkUnit,
        plan: &ConversionPlan,
        monthly: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&unit.working_path).await?;
        let mut ledger = ArtifactLedger::new(self.transcoder.as_ref());
        let field = unit.variable.field_name().to_string();

        let daily = match unit.variable.frequency {
            Frequency::Daily => self.prepare_granule(unit, plan, &mut ledger, cancel).await?,
            Frequency::ThreeHourly => {
                let sub_daily = self.prepare_granule(unit, plan, &mut ledger, cancel).await?;
                self.reduce_to_daily(unit, &[sub_daily], &field, &mut ledger, cancel)
                    .await?
            }
            Frequency::Hourly => {
                let mut scheduler = AggregationScheduler::for_unit(unit);
                for day in 1..=scheduler.expected_days() {
                    let step = unit.with_day(day)?;
                    match self.prepare_granule(&step, plan, &mut ledger, cancel).await {
                        Ok(artifact) => scheduler.record_success(day, artifact),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!("Day {} failed: {}", step, e);
                            scheduler.record_failure(day, e.to_string());
                        }
                    }
                }
                let partials = scheduler.into_ordered_inputs()?;
                self.reduce_to_daily(unit, &partials, &field, &mut ledger, cancel)
                    .await?
            }
        };

        let shape = self.check_daily(unit, &daily, cancel).await?;

        let levels = match unit.variable.family {
            SourceFamily::PressureLevel => Some(shape.levels.unwrap_or(1)),
            SourceFamily::Surface => None,
        };
        let chunks = self.config.chunk_spec(levels);
        let chunked = self.work_file(unit, "chunked");
        self.stage(
            "regrid-and-chunk",
            cancel,
            self.transcoder
                .regrid_and_chunk(&daily, self.config.grid.as_ref(), &chunks, &chunked),
        )
        .await?;
        ledger.consumed(&[daily]).await;
        ledger.produced(&chunked);

        if let Some(parent) = unit.archive_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let cmip_name = unit.variable.cmip_name.as_str();
        self.stage(
            "rename",
            cancel,
            self.transcoder
                .rename(&chunked, &field, cmip_name, &unit.archive_path),
        )
        .await?;
        ledger.consumed(&[chunked]).await;

        self.monthly_mean(unit, monthly, cancel).await?;
        Ok(ledger.into_fetched())
    }

    /// Fetch, normalize and convert the inputs of one granule (a month, or a
    /// day of a sub-daily month) into a single converted artifact
    async fn prepare_granule(
        &self,
        step: &WorkUnit,
        plan: &ConversionPlan,
        ledger: &mut ArtifactLedger<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let overwrite = self.config.flags.overwrite;
        let mut converted: Vec<(PathBuf, String)> = Vec::with_capacity(plan.inputs.len());

        for input in &plan.inputs {
            let request = FetchRequest::for_input(input, step);
            let raw = self
                .stage(
                    "fetch",
                    cancel,
                    self.fetcher.acquire(&request, &step.source_path, overwrite),
                )
                .await?;
            ledger.fetched(&raw);

            let normalized = self.work_file(step, &format!("{}.norm", input.short_name));
            self.stage(
                "normalize-format",
                cancel,
                self.transcoder.normalize_format(&raw, input, &normalized),
            )
            .await?;
            ledger.produced(&normalized);

            if plan.is_derived() {
                converted.push((normalized, input.short_name.clone()));
                continue;
            }

            let output = self.work_file(step, &format!("{}.conv", input.short_name));
            self.stage(
                "unit-convert",
                cancel,
                self.transcoder.apply_unit_conversion(
                    &normalized,
                    &input.short_name,
                    &plan.conversion,
                    &plan.variable.cmip_unit,
                    &output,
                ),
            )
            .await?;
            ledger.consumed(&[normalized]).await;
            ledger.produced(&output);
            converted.push((output, input.short_name.clone()));
        }

        if let UnitConversion::Derived(recipe) = &plan.conversion {
            let output = self.work_file(step, &format!("{}.derived", plan.variable.short_name));
            self.stage(
                "unit-convert",
                cancel,
                self.transcoder
                    .derive_field(&converted, recipe, &plan.variable.short_name, &output),
            )
            .await?;
            let consumed: Vec<PathBuf> = converted.into_iter().map(|(path, _)| path).collect();
            ledger.consumed(&consumed).await;
            ledger.produced(&output);
            return Ok(output);
        }

        converted
            .pop()
            .map(|(path, _)| path)
            .ok_or_else(|| ProcessorError::stage("unit-convert", format!("{} has no inputs", step)))
    }

    async fn reduce_to_daily(
        &self,
        unit: &WorkUnit,
        inputs: &[PathBuf],
        field: &str,
        ledger: &mut ArtifactLedger<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let reducer: Reducer = unit.variable.reducer;
        let output = self.work_file(unit, "daily");
        info!("Aggregating {} partials of {} with {}", inputs.len(), unit, reducer);
        self.stage(
            "aggregate",
            cancel,
            self.transcoder
                .reduce_time(inputs, field, reducer, TimeBucket::Day, &output),
        )
        .await?;
        ledger.consumed(inputs).await;
        ledger.produced(&output);
        Ok(output)
    }

    /// One time step per calendar day, and the configured level count
    async fn check_daily(&self, unit: &WorkUnit, daily: &Path, cancel: &CancellationToken) -> Result<FieldShape> {
        let shape = self
            .stage("inspect", cancel, self.transcoder.inspect(daily))
            .await?;

        let expected = unit.days_in_month() as usize;
        if shape.times != expected {
            return Err(ProcessorError::integrity(
                daily,
                format!("expected {expected} daily time steps, found {}", shape.times),
            ));
        }

        if unit.variable.family == SourceFamily::PressureLevel {
            if let Some(expected_levels) = self.config.chunking.expected_levels {
                let found = shape.levels.unwrap_or(1);
                if found != expected_levels {
                    return Err(ProcessorError::integrity(
                        daily,
                        format!("expected {expected_levels} levels, found {found}"),
                    ));
                }
            }
        }

        debug!("{} has shape {:?}", unit, shape);
        Ok(shape)
    }

    /// Monthly mean of this unit's own daily archive
    async fn monthly_mean(&self, unit: &WorkUnit, monthly: &Path, cancel: &CancellationToken) -> Result<()> {
        if !unit.archive_path.is_file() {
            return Err(ProcessorError::integrity(
                &unit.archive_path,
                "daily archive missing before monthly mean",
            ));
        }
        if let Some(parent) = monthly.parent() {
            fs::create_dir_all(parent).await?;
        }

        self.stage(
            "monthly-mean",
            cancel,
            self.transcoder.reduce_time(
                std::slice::from_ref(&unit.archive_path),
                &unit.variable.cmip_name,
                Reducer::Mean,
                TimeBucket::Month,
                monthly,
            ),
        )
        .await
    }

    /// Run one stage, aborting when the run is cancelled
    async fn stage<T>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if cancel.is_cancelled() {
            return Err(ProcessorError::Cancelled {
                reason: format!("before {name}"),
            });
        }
        debug!("Stage {}", name);
        tokio::select! {
            _ = cancel.cancelled() => Err(ProcessorError::Cancelled {
                reason: format!("during {name}"),
            }),
            result = work => result.map_err(|e| e.within_stage(name)),
        }
    }

    fn work_file(&self, step: &WorkUnit, tag: &str) -> PathBuf {
        step.working_path.join(format!(
            "{}_{}.{}.{}",
            step.variable.short_name,
            step.date_token(),
            tag,
            self.transcoder.extension()
        ))
    }

    async fn remove_work_dir(&self, unit: &WorkUnit) {
        match fs::remove_dir_all(&unit.working_path).await {
            Ok(()) => debug!("Removed {}", unit.working_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", unit.working_path.display(), e),
        }
    }
}
