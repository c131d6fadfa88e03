//! Scenario tests for the pipeline engine
//!
//! Units run against a pool laid out on disk under a temporary directory,
//! fetched with the mirror fetcher and transformed with the polars backend.
//! Counting wrappers record how often the capabilities were touched.

pub mod idempotency;

use crate::catalog::VariableCatalog;
use crate::checkpoint::{CheckpointState, CheckpointStore, MemoryCheckpointStore};
use crate::config::{Backend, PipelineConfig, StoreKind};
use crate::conversion::{DerivedField, UnitConversion};
use crate::error::{ProcessorError, Result};
use crate::fetcher::{FetchRequest, Fetcher, MirrorFetcher};
use crate::models::{Reducer, VariableDescriptor, WorkUnit};
use crate::processor::PipelineEngine;
use crate::transcoder::{ChunkSpec, FieldShape, FrameTranscoder, TargetGrid, TimeBucket, Transcoder};

use async_trait::async_trait;
use polars::prelude::DataType;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub struct CountingFetcher {
    inner: MirrorFetcher,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn acquire(&self, request: &FetchRequest, dest_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(request, dest_dir, overwrite).await
    }
}

/// Polars backend that counts calls and can be told to fail one stage, or
/// to hang in one stage after its output is written
pub struct CountingTranscoder {
    inner: FrameTranscoder,
    calls: AtomicUsize,
    fail_stage: Mutex<Option<&'static str>>,
    hold_stage: Mutex<Option<&'static str>>,
    /// Signalled when a held stage has written its output
    pub held: Notify,
}

impl CountingTranscoder {
    pub fn fail_on(&self, stage: &'static str) {
        *self.fail_stage.lock().unwrap() = Some(stage);
    }

    pub fn hold_after(&self, stage: &'static str) {
        *self.hold_stage.lock().unwrap() = Some(stage);
    }

    /// Never returns when `stage` is held, like a tool that stops responding
    async fn leave(&self, stage: &'static str, result: Result<()>) -> Result<()> {
        let held = *self.hold_stage.lock().unwrap() == Some(stage);
        if held && result.is_ok() {
            self.held.notify_one();
            return std::future::pending().await;
        }
        result
    }

    fn enter(&self, stage: &'static str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_stage.lock().unwrap() == Some(stage) {
            return Err(ProcessorError::stage(stage, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transcoder for CountingTranscoder {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn extension(&self) -> &'static str {
        self.inner.extension()
    }

    fn artifact_files(&self, path: &Path) -> Vec<PathBuf> {
        self.inner.artifact_files(path)
    }

    async fn normalize_format(&self, raw: &Path, input: &VariableDescriptor, output: &Path) -> Result<()> {
        self.enter("normalize-format")?;
        self.inner.normalize_format(raw, input, output).await
    }

    async fn apply_unit_conversion(
        &self,
        input: &Path,
        field: &str,
        conversion: &UnitConversion,
        cmip_unit: &str,
        output: &Path,
    ) -> Result<()> {
        self.enter("unit-convert")?;
        self.inner
            .apply_unit_conversion(input, field, conversion, cmip_unit, output)
            .await
    }

    async fn derive_field(
        &self,
        inputs: &[(PathBuf, String)],
        recipe: &DerivedField,
        field: &str,
        output: &Path,
    ) -> Result<()> {
        self.enter("derive")?;
        self.inner.derive_field(inputs, recipe, field, output).await
    }

    async fn reduce_time(
        &self,
        inputs: &[PathBuf],
        field: &str,
        reducer: Reducer,
        bucket: TimeBucket,
        output: &Path,
    ) -> Result<()> {
        self.enter("aggregate")?;
        self.inner
            .reduce_time(inputs, field, reducer, bucket, output)
            .await
    }

    async fn regrid_and_chunk(
        &self,
        input: &Path,
        grid: Option<&TargetGrid>,
        chunks: &ChunkSpec,
        output: &Path,
    ) -> Result<()> {
        self.enter("regrid-and-chunk")?;
        self.inner.regrid_and_chunk(input, grid, chunks, output).await
    }

    async fn rename(&self, input: &Path, from: &str, to: &str, output: &Path) -> Result<()> {
        self.enter("rename")?;
        let result = self.inner.rename(input, from, to, output).await;
        self.leave("rename", result).await
    }

    async fn inspect(&self, input: &Path) -> Result<FieldShape> {
        self.enter("inspect")?;
        self.inner.inspect(input).await
    }
}

/// Engine over a temporary pool, work area and archive
pub struct Harness {
    pub temp_dir: TempDir,
    pub engine: PipelineEngine,
    pub fetcher: Arc<CountingFetcher>,
    pub transcoder: Arc<CountingTranscoder>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

/// Sample hours of every day in sub-daily fixtures
pub const SAMPLE_HOURS: [u32; 4] = [0, 6, 12, 18];

/// Longitudes of the two grid points in every fixture
pub const SAMPLE_LONS: [f64; 2] = [0.0, 1.0];

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(PipelineConfig) -> PipelineConfig) -> Self {
        Self::build(adjust, VariableCatalog::builtin())
    }

    pub fn build(adjust: impl FnOnce(PipelineConfig) -> PipelineConfig, catalog: VariableCatalog) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let base = PipelineConfig::rooted_at(temp_dir.path())
            .with_variables(["t2m"])
            .with_years(2024, 2024)
            .with_store(StoreKind::Mirror)
            .with_backend(Backend::Frame);
        let config = Arc::new(adjust(base));

        let fetcher = Arc::new(CountingFetcher {
            inner: MirrorFetcher::new(config.paths.origin.clone()),
            calls: AtomicUsize::new(0),
        });
        let transcoder = Arc::new(CountingTranscoder {
            inner: FrameTranscoder::new(),
            calls: AtomicUsize::new(0),
            fail_stage: Mutex::new(None),
            hold_stage: Mutex::new(None),
            held: Notify::new(),
        });
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let table = Arc::new(config.conversion_table());

        let engine = PipelineEngine::new(
            config,
            Arc::new(catalog),
            table,
            fetcher.clone(),
            transcoder.clone(),
            checkpoints.clone(),
        );

        Self {
            temp_dir,
            engine,
            fetcher,
            transcoder,
            checkpoints,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        self.engine.config()
    }

    pub fn unit(&self, short_name: &str, year: i32, month: u32) -> WorkUnit {
        let descriptor = self.engine.catalog().lookup(short_name).unwrap().clone();
        self.unit_for(descriptor, year, month)
    }

    pub fn unit_for(&self, descriptor: VariableDescriptor, year: i32, month: u32) -> WorkUnit {
        WorkUnit::new(descriptor, year, month, self.engine.layout()).unwrap()
    }

    /// (fetch calls, transcoder calls)
    pub fn calls(&self) -> (usize, usize) {
        (
            self.fetcher.calls.load(Ordering::SeqCst),
            self.transcoder.calls.load(Ordering::SeqCst),
        )
    }

    pub fn state(&self, unit: &WorkUnit) -> Option<CheckpointState> {
        self.checkpoints.state(&unit.checkpoint_key()).unwrap()
    }

    /// Write the pool file of raw field `input` for `step` (a month or a day)
    pub fn write_source(&self, input: &str, step: &WorkUnit, rows: &[(String, f64, f64)]) -> PathBuf {
        let descriptor = self.engine.catalog().lookup(input).unwrap();
        let request = FetchRequest::for_input(descriptor, step);
        let dir = request.pool_dir(&self.config().paths.origin);
        fs::create_dir_all(&dir).unwrap();

        let mut csv = format!("time,lat,lon,{input}\n");
        for (time, lon, value) in rows {
            csv.push_str(&format!("{time},50.0,{lon},{value}\n"));
        }
        let path = dir.join(format!("{}.csv", request.file_stem()));
        fs::write(&path, csv).unwrap();
        path
    }

    /// Monthly source with one value per day at both grid points
    pub fn write_daily_month(&self, unit: &WorkUnit, input: &str, days: u32, value: impl Fn(u32) -> f64) {
        let mut rows = Vec::new();
        for day in 1..=days {
            for lon in SAMPLE_LONS {
                rows.push((timestamp(unit.year, unit.month, day, 0), lon, value(day)));
            }
        }
        self.write_source(input, unit, &rows);
    }

    /// One source per day holding [`SAMPLE_HOURS`] at both grid points
    pub fn write_hourly_days(
        &self,
        unit: &WorkUnit,
        input: &str,
        days: impl IntoIterator<Item = u32>,
        value: impl Fn(u32, u32) -> f64,
    ) {
        for day in days {
            let step = unit.with_day(day).unwrap();
            let mut rows = Vec::new();
            for hour in SAMPLE_HOURS {
                for lon in SAMPLE_LONS {
                    rows.push((timestamp(unit.year, unit.month, day, hour), lon, value(day, hour)));
                }
            }
            self.write_source(input, &step, &rows);
        }
    }

    pub fn work_dir_is_empty(&self) -> bool {
        let work = &self.config().paths.work;
        !work.exists()
            || walkdir::WalkDir::new(work)
                .into_iter()
                .filter_map(|e| e.ok())
                .all(|e| !e.file_type().is_file())
    }
}

pub fn timestamp(year: i32, month: u32, day: u32, hour: u32) -> String {
    format!("{year}-{month:02}-{day:02}T{hour:02}:00:00")
}

/// Values of `column` in an archived Parquet artifact
pub fn column_values(path: &Path, column: &str) -> Vec<f64> {
    let df = FrameTranscoder::read_frame(path).unwrap();
    let series = df
        .column(column)
        .unwrap()
        .as_materialized_series()
        .cast(&DataType::Float64)
        .unwrap();
    series.f64().unwrap().into_iter().map(|v| v.unwrap()).collect()
}
