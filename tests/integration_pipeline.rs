//! End-to-end tests of the pipeline through the public API
//!
//! A YAML configuration points the mirror store at a pool laid out in a
//! temporary directory; the polars backend writes the archive. These runs
//! use the file checkpoint store exactly as the CLI does.

use chrono::{Datelike, NaiveDate};
use reanalysis_processor::fetcher::FetchRequest;
use reanalysis_processor::models::WorkUnit;
use reanalysis_processor::transcoder::FrameTranscoder;
use reanalysis_processor::{
    Backend, CheckpointState, CheckpointStore, FileCheckpointStore, PipelineConfig, PipelineEngine,
    ProcessorError, RunDriver, StoreKind, UnitOutcome,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_config(root: &Path, variables: &[&str]) -> PathBuf {
    let yaml = format!(
        r#"
dataset:
  source: era5
  store: mirror
variables: [{variables}]
time:
  start_year: 2023
  end_year: 2023
  months: "01, 02"
paths:
  origin: {root}/pool
  download: {root}/download
  work: {root}/work
  proc: {root}/proc
cleanup:
  remove_sources: false
execution:
  backend: frame
  max_concurrent_units: 2
"#,
        variables = variables.join(", "),
        root = root.display()
    );
    let path = root.join("config.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

/// Monthly pool file of `input` holding one value per day at two grid points
fn write_daily_source(engine: &PipelineEngine, unit: &WorkUnit, input: &str, value: f64) {
    let descriptor = engine.catalog().lookup(input).unwrap();
    let request = FetchRequest::for_input(descriptor, unit);
    let dir = request.pool_dir(&engine.config().paths.origin);
    fs::create_dir_all(&dir).unwrap();

    let mut csv = format!("time,lat,lon,{input}\n");
    let first = NaiveDate::from_ymd_opt(unit.year, unit.month, 1).unwrap();
    for day in first.iter_days().take_while(|d| d.month() == unit.month) {
        for lon in [10.0, 10.25] {
            csv.push_str(&format!("{}T12:00:00,45.0,{lon},{value}\n", day));
        }
    }
    fs::write(dir.join(format!("{}.csv", request.file_stem())), csv).unwrap();
}

fn engine_for(config_path: &Path) -> Arc<PipelineEngine> {
    let config = PipelineConfig::load(config_path).unwrap();
    assert_eq!(config.dataset.store, StoreKind::Mirror);
    assert_eq!(config.execution.backend, Backend::Frame);
    Arc::new(PipelineEngine::from_config(Arc::new(config)).unwrap())
}

fn seed_pool(engine: &Arc<PipelineEngine>) -> Vec<WorkUnit> {
    let units = RunDriver::new(engine.clone()).plan_units().unwrap();
    for unit in &units {
        let value = if unit.variable.short_name == "tcc" { 0.25 } else { 275.0 };
        write_daily_source(engine, unit, &unit.variable.short_name, value);
    }
    units
}

fn values(path: &Path, column: &str) -> Vec<f64> {
    let df = FrameTranscoder::read_frame(path).unwrap();
    let series = df
        .column(column)
        .unwrap()
        .as_materialized_series()
        .cast(&polars::prelude::DataType::Float64)
        .unwrap();
    series.f64().unwrap().into_iter().map(|v| v.unwrap()).collect()
}

#[tokio::test]
async fn test_full_run_then_idempotent_rerun() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), &["t2m", "tcc"]);
    let engine = engine_for(&config_path);
    let units = seed_pool(&engine);
    assert_eq!(units.len(), 4);

    let driver = RunDriver::new(engine.clone());
    let summary = driver.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.units_completed, 4);
    assert_eq!(summary.units_failed(), 0);

    let proc = temp_dir.path().join("proc");
    let january = proc.join("tas/day/native/2023/tas_day_era5_202301.parquet");
    assert!(january.is_file());
    assert_eq!(values(&january, "tas").len(), 31 * 2);
    assert!(proc.join("tas/mon/native/2023/tas_mon_era5_202302.parquet").is_file());

    let clt = proc.join("clt/day/native/2023/clt_day_era5_202302.parquet");
    let clt_values = values(&clt, "clt");
    assert_eq!(clt_values.len(), 28 * 2);
    assert!(clt_values.iter().all(|v| (v - 25.0).abs() < 1e-9));

    let checkpoints = FileCheckpointStore::new(
        engine.config().checkpoint_dir(),
        engine.config().stale_lock_after(),
    )
    .unwrap();
    for unit in &units {
        assert_eq!(
            checkpoints.state(&unit.checkpoint_key()).unwrap(),
            Some(CheckpointState::Completed)
        );
    }
    assert!(temp_dir.path().join("work/checkpoints/2023_01_t2m.completed").is_file());

    // A fresh engine over the same directories finds everything done
    let rerun = RunDriver::new(engine_for(&config_path));
    let summary = rerun.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.units_completed, 0);
    assert_eq!(summary.units_already_complete, 4);
}

#[tokio::test]
async fn test_single_unit_outcome_paths() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), &["t2m"]);
    let engine = engine_for(&config_path);
    let units = seed_pool(&engine);

    let outcome = engine
        .process(&units[0], &CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        UnitOutcome::Completed { archive, monthly } => {
            assert_eq!(archive, units[0].archive_path);
            let monthly_values = values(&monthly, "tas");
            assert_eq!(monthly_values.len(), 2);
            assert!(monthly_values.iter().all(|v| (v - 275.0).abs() < 1e-9));
        }
        other => panic!("Expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.yaml");
    fs::write(
        &path,
        "variables: []\ntime: {start_year: 2023, end_year: 2023}\n\
         paths: {download: /d, work: /w, proc: /p}\n",
    )
    .unwrap();

    match PipelineConfig::load(&path) {
        Err(ProcessorError::Configuration { message }) => {
            assert!(message.contains("no variables"), "{message}")
        }
        other => panic!("Expected Configuration error, got {other:?}"),
    }
}
