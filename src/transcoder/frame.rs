//! In-process transcoder built on polars.
//!
//! Fields are stored as long Parquet tables with the columns
//! `time, [level], lat, lon, <field>`, where `time` holds epoch seconds.
//! Attributes that NetCDF would keep on the variable (units, names, fill
//! value, chunking) live in a JSON sidecar next to the table:
//! ```text
//! tas_day_era5_202406.parquet
//! tas_day_era5_202406.parquet.attrs.json
//! ```
//! Raw inputs may be CSV or Parquet and may use the alternative axis names
//! (`valid_time`, `latitude`, `longitude`, `pressure_level`).

use super::{ChunkSpec, FieldShape, TargetGrid, TimeBucket, Transcoder};
use crate::constants::{AXIS_ALIASES, LAT_AXIS, LEVEL_AXIS, LON_AXIS, TIME_AXIS};
use crate::conversion::{DerivedField, DerivedKind, UnitConversion};
use crate::error::{ProcessorError, Result};
use crate::models::{Reducer, SourceFamily, VariableDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::debug;

const ATTRS_SUFFIX: &str = ".attrs.json";
const SECONDS_PER_DAY: i64 = 86_400;

/// Variable attributes kept beside a Parquet artifact
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldAttributes {
    pub name: String,
    pub units: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<f64>,
    /// Chunk lengths in axis order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameTranscoder;

impl FrameTranscoder {
    pub fn new() -> Self {
        Self
    }

    pub fn attributes_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(ATTRS_SUFFIX);
        PathBuf::from(name)
    }

    pub fn read_attributes(path: &Path) -> Result<FieldAttributes> {
        let content = fs::read_to_string(Self::attributes_path(path))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn read_frame(path: &Path) -> Result<DataFrame> {
        Ok(ParquetReader::new(File::open(path)?).finish()?)
    }
}

/// Shared between a stage future and its blocking worker. Once the stage is
/// dropped the worker may not write anything; a write already in progress
/// finishes before the drop returns.
#[derive(Debug, Clone, Default)]
struct WriteGate(Arc<Mutex<bool>>);

impl WriteGate {
    fn publish(&self, path: &Path, write: impl FnOnce() -> Result<()>) -> Result<()> {
        let closed = self
            .0
            .lock()
            .map_err(|_| ProcessorError::stage("write", "write gate poisoned"))?;
        if *closed {
            return Err(ProcessorError::Cancelled {
                reason: format!("stage dropped before writing {}", path.display()),
            });
        }
        write()
    }

    fn close(&self) {
        match self.0.lock() {
            Ok(mut closed) => *closed = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
    }
}

struct CloseOnDrop(WriteGate);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Run `work` on the blocking pool. Dropping the returned future (a cancelled
/// stage) closes the gate so a detached worker cannot write afterwards.
async fn blocking<T, F>(stage: &'static str, work: F) -> Result<T>
where
    F: FnOnce(&WriteGate) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let gate = WriteGate::default();
    let _close = CloseOnDrop(gate.clone());
    task::spawn_blocking(move || work(&gate))
        .await
        .map_err(|e| ProcessorError::stage(stage, format!("worker task failed: {e}")))?
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

fn f64_values(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = df
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

fn parse_time(value: &str) -> Option<i64> {
    let value = value.trim();
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Time column as epoch seconds, whatever its stored type
fn time_values(df: &DataFrame) -> Result<Vec<i64>> {
    let series = df.column(TIME_AXIS)?.as_materialized_series();
    let invalid = |row: usize| ProcessorError::stage("normalize-format", format!("invalid time value in row {row}"));

    match series.dtype() {
        DataType::String => series
            .str()?
            .into_iter()
            .enumerate()
            .map(|(row, v)| v.and_then(parse_time).ok_or_else(|| invalid(row)))
            .collect(),
        DataType::Datetime(unit, _) => {
            let divisor = match unit {
                TimeUnit::Milliseconds => 1_000,
                TimeUnit::Microseconds => 1_000_000,
                TimeUnit::Nanoseconds => 1_000_000_000,
            };
            let raw = series.cast(&DataType::Int64)?;
            raw.i64()?
                .into_iter()
                .enumerate()
                .map(|(row, v)| v.map(|t| t.div_euclid(divisor)).ok_or_else(|| invalid(row)))
                .collect()
        }
        _ => {
            let raw = series.cast(&DataType::Int64)?;
            raw.i64()?
                .into_iter()
                .enumerate()
                .map(|(row, v)| v.ok_or_else(|| invalid(row)))
                .collect()
        }
    }
}

/// Axis columns present in `df`, in canonical order
fn axis_keys(df: &DataFrame) -> Vec<&'static str> {
    [TIME_AXIS, LEVEL_AXIS, LAT_AXIS, LON_AXIS]
        .into_iter()
        .filter(|axis| has_column(df, axis))
        .collect()
}

fn sort_canonical(df: DataFrame) -> Result<DataFrame> {
    let keys: Vec<Expr> = axis_keys(&df).into_iter().map(col).collect();
    Ok(df
        .lazy()
        .sort_by_exprs(keys, SortMultipleOptions::default())
        .collect()?)
}

fn read_raw(path: &Path) -> Result<DataFrame> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => Ok(CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?),
        "parquet" => FrameTranscoder::read_frame(path),
        other => Err(ProcessorError::stage(
            "normalize-format",
            format!("unsupported raw format '{other}' for {}", path.display()),
        )),
    }
}

fn read_artifact(path: &Path) -> Result<(DataFrame, FieldAttributes)> {
    Ok((
        FrameTranscoder::read_frame(path)?,
        FrameTranscoder::read_attributes(path)?,
    ))
}

/// Encode in memory, then write table and sidecar through the gate
fn write_artifact(df: &mut DataFrame, attrs: &FieldAttributes, path: &Path, gate: &WriteGate) -> Result<()> {
    let row_group_size = attrs
        .chunking
        .as_ref()
        .map(|chunks| chunks.iter().product::<usize>().max(1));

    let mut table = Vec::new();
    ParquetWriter::new(&mut table)
        .with_compression(ParquetCompression::Snappy)
        .with_row_group_size(row_group_size)
        .finish(df)?;
    let sidecar = serde_json::to_vec_pretty(attrs)?;

    gate.publish(path, || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &table)?;
        fs::write(FrameTranscoder::attributes_path(path), &sidecar)?;
        Ok(())
    })?;

    debug!("Wrote {} rows to {}", df.height(), path.display());
    Ok(())
}

fn require_column(df: &DataFrame, name: &str, stage: &str, path: &Path) -> Result<()> {
    if has_column(df, name) {
        Ok(())
    } else {
        Err(ProcessorError::stage(
            stage,
            format!("column '{name}' missing in {}", path.display()),
        ))
    }
}

fn normalize(raw: &Path, input: &VariableDescriptor, output: &Path, gate: &WriteGate) -> Result<()> {
    let mut df = read_raw(raw)?;

    for (alias, canonical) in AXIS_ALIASES {
        if has_column(&df, alias) && !has_column(&df, canonical) {
            df.rename(alias, (*canonical).into())?;
        }
    }

    let field = input.short_name.as_str();
    let pressure = input.family == SourceFamily::PressureLevel;
    let mut required = vec![TIME_AXIS, LAT_AXIS, LON_AXIS, field];
    if pressure {
        required.push(LEVEL_AXIS);
    }
    for name in required {
        require_column(&df, name, "normalize-format", raw)?;
    }

    let mut columns = vec![Column::new(TIME_AXIS.into(), time_values(&df)?)];
    if pressure {
        columns.push(Column::new(LEVEL_AXIS.into(), f64_values(&df, LEVEL_AXIS)?));
    }
    columns.push(Column::new(LAT_AXIS.into(), f64_values(&df, LAT_AXIS)?));
    columns.push(Column::new(LON_AXIS.into(), f64_values(&df, LON_AXIS)?));
    columns.push(Column::new(field.into(), f64_values(&df, field)?));

    let mut canonical = sort_canonical(DataFrame::new(columns)?)?;
    let attrs = FieldAttributes {
        name: field.to_string(),
        units: input.native_unit.clone(),
        long_name: input.long_name.clone(),
        ..Default::default()
    };
    write_artifact(&mut canonical, &attrs, output, gate)
}

fn convert(
    input: &Path,
    field: &str,
    conversion: &UnitConversion,
    cmip_unit: &str,
    output: &Path,
    gate: &WriteGate,
) -> Result<()> {
    let (df, mut attrs) = read_artifact(input)?;
    require_column(&df, field, "unit-convert", input)?;

    let mut df = match conversion {
        UnitConversion::Identity | UnitConversion::Relabel => df,
        UnitConversion::Multiply { factor } => df
            .lazy()
            .with_column((col(field) * lit(*factor)).alias(field))
            .collect()?,
        UnitConversion::Divide { divisor } => df
            .lazy()
            .with_column((col(field) / lit(*divisor)).alias(field))
            .collect()?,
        UnitConversion::Derived(_) => {
            return Err(ProcessorError::stage(
                "unit-convert",
                "derived fields are computed by derive_field",
            ));
        }
    };

    attrs.units = cmip_unit.to_string();
    write_artifact(&mut df, &attrs, output, gate)
}

/// Axis coordinates of every row, used to check that inputs line up
#[derive(Debug, PartialEq)]
struct AxisColumns {
    times: Vec<i64>,
    levels: Option<Vec<f64>>,
    lats: Vec<f64>,
    lons: Vec<f64>,
}

impl AxisColumns {
    fn from_frame(df: &DataFrame) -> Result<Self> {
        Ok(Self {
            times: time_values(df)?,
            levels: if has_column(df, LEVEL_AXIS) {
                Some(f64_values(df, LEVEL_AXIS)?)
            } else {
                None
            },
            lats: f64_values(df, LAT_AXIS)?,
            lons: f64_values(df, LON_AXIS)?,
        })
    }

    fn into_columns(self) -> Vec<Column> {
        let mut columns = vec![Column::new(TIME_AXIS.into(), self.times)];
        if let Some(levels) = self.levels {
            columns.push(Column::new(LEVEL_AXIS.into(), levels));
        }
        columns.push(Column::new(LAT_AXIS.into(), self.lats));
        columns.push(Column::new(LON_AXIS.into(), self.lons));
        columns
    }
}

fn derive(
    inputs: &[(PathBuf, String)],
    recipe: &DerivedField,
    field: &str,
    output: &Path,
    gate: &WriteGate,
) -> Result<()> {
    let mut axes: Option<AxisColumns> = None;
    let mut sum_of_squares: Vec<f64> = Vec::new();

    for (path, name) in inputs {
        let (df, _) = read_artifact(path)?;
        require_column(&df, name, "derive", path)?;
        let df = sort_canonical(df)?;
        let these = AxisColumns::from_frame(&df)?;
        let values = f64_values(&df, name)?;

        match &axes {
            None => {
                sum_of_squares = values.iter().map(|v| v * v).collect();
                axes = Some(these);
            }
            Some(existing) => {
                if *existing != these {
                    return Err(ProcessorError::stage(
                        "derive",
                        format!("{name} is not aligned with the other inputs on time/lat/lon"),
                    ));
                }
                for (sum, v) in sum_of_squares.iter_mut().zip(values) {
                    *sum += v * v;
                }
            }
        }
    }

    let axes = axes.ok_or_else(|| ProcessorError::stage("derive", "no input fields"))?;
    let values: Vec<f64> = match recipe.method {
        DerivedKind::Magnitude => sum_of_squares
            .into_iter()
            .map(|s| if s.is_nan() { recipe.fill_value } else { s.sqrt() })
            .collect(),
    };

    let mut columns = axes.into_columns();
    columns.push(Column::new(field.into(), values));
    let mut df = DataFrame::new(columns)?;

    let attrs = FieldAttributes {
        name: field.to_string(),
        units: recipe.units.clone(),
        long_name: recipe.long_name.clone(),
        standard_name: Some(recipe.standard_name.clone()),
        fill_value: Some(recipe.fill_value),
        chunking: None,
    };
    write_artifact(&mut df, &attrs, output, gate)
}

fn bucket_start(time: i64, bucket: TimeBucket) -> Result<i64> {
    match bucket {
        TimeBucket::Day => Ok(time.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY),
        TimeBucket::Month => DateTime::from_timestamp(time, 0)
            .and_then(|dt| NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| ProcessorError::stage("aggregate", format!("time {time} out of range"))),
    }
}

fn reducer_expr(field: &str, reducer: Reducer) -> Expr {
    match reducer {
        Reducer::Mean => col(field).mean(),
        Reducer::Min => col(field).min(),
        Reducer::Max => col(field).max(),
    }
    .alias(field)
}

/// Group rows on all axis columns and reduce `field`
fn group_reduce(df: DataFrame, field: &str, reducer: Reducer) -> Result<DataFrame> {
    let keys: Vec<Expr> = axis_keys(&df).into_iter().map(col).collect();
    Ok(df
        .lazy()
        .group_by(keys.clone())
        .agg([reducer_expr(field, reducer)])
        .sort_by_exprs(keys, SortMultipleOptions::default())
        .collect()?)
}

fn reduce(
    inputs: &[PathBuf],
    field: &str,
    reducer: Reducer,
    bucket: TimeBucket,
    output: &Path,
    gate: &WriteGate,
) -> Result<()> {
    let mut frames = Vec::with_capacity(inputs.len());
    let mut attrs: Option<FieldAttributes> = None;
    for path in inputs {
        let (df, a) = read_artifact(path)?;
        require_column(&df, field, "aggregate", path)?;
        attrs.get_or_insert(a);
        frames.push(df.lazy());
    }
    let mut attrs = attrs.ok_or_else(|| ProcessorError::stage("aggregate", "no inputs to reduce"))?;

    let mut combined = concat(frames, UnionArgs::default())?.collect()?;
    let buckets = time_values(&combined)?
        .into_iter()
        .map(|t| bucket_start(t, bucket))
        .collect::<Result<Vec<i64>>>()?;
    combined.with_column(Column::new(TIME_AXIS.into(), buckets))?;

    let mut reduced = group_reduce(combined, field, reducer)?;
    attrs.chunking = None;
    write_artifact(&mut reduced, &attrs, output, gate)
}

/// Box-average every source cell onto the nearest cell of a regular grid
#[allow(clippy::too_many_arguments)]
fn regrid_regular(
    df: DataFrame,
    field: &str,
    lat_first: f64,
    lat_inc: f64,
    lat_count: usize,
    lon_first: f64,
    lon_inc: f64,
    lon_count: usize,
) -> Result<DataFrame> {
    if lat_inc == 0.0 || lon_inc == 0.0 {
        return Err(ProcessorError::stage("regrid-and-chunk", "grid increment must be non-zero"));
    }

    let snap = |value: f64, first: f64, inc: f64, count: usize| -> Option<f64> {
        let index = ((value - first) / inc).round();
        (index >= 0.0 && (index as usize) < count).then(|| first + index * inc)
    };
    let snap_lon = |value: f64| -> Option<f64> {
        [value, value - 360.0, value + 360.0]
            .into_iter()
            .find_map(|v| snap(v, lon_first, lon_inc, lon_count))
    };

    let axes = AxisColumns::from_frame(&df)?;
    let values = f64_values(&df, field)?;

    let mut kept = AxisColumns {
        times: Vec::new(),
        levels: axes.levels.as_ref().map(|_| Vec::new()),
        lats: Vec::new(),
        lons: Vec::new(),
    };
    let mut kept_values = Vec::new();

    for row in 0..values.len() {
        let (Some(lat), Some(lon)) = (
            snap(axes.lats[row], lat_first, lat_inc, lat_count),
            snap_lon(axes.lons[row]),
        ) else {
            continue;
        };
        kept.times.push(axes.times[row]);
        if let (Some(out), Some(levels)) = (kept.levels.as_mut(), axes.levels.as_ref()) {
            out.push(levels[row]);
        }
        kept.lats.push(lat);
        kept.lons.push(lon);
        kept_values.push(values[row]);
    }

    let mut columns = kept.into_columns();
    columns.push(Column::new(field.into(), kept_values));
    group_reduce(DataFrame::new(columns)?, field, Reducer::Mean)
}

fn regrid_and_chunk(
    input: &Path,
    grid: Option<&TargetGrid>,
    chunks: &ChunkSpec,
    output: &Path,
    gate: &WriteGate,
) -> Result<()> {
    let (df, mut attrs) = read_artifact(input)?;
    let field = attrs.name.clone();
    require_column(&df, &field, "regrid-and-chunk", input)?;

    let df = match grid {
        None => df,
        Some(TargetGrid::Regular {
            lat_first,
            lat_inc,
            lat_count,
            lon_first,
            lon_inc,
            lon_count,
        }) => regrid_regular(
            df, &field, *lat_first, *lat_inc, *lat_count, *lon_first, *lon_inc, *lon_count,
        )?,
        Some(TargetGrid::File { path }) => {
            return Err(ProcessorError::stage(
                "regrid-and-chunk",
                format!(
                    "grid description file {} requires the cdo backend",
                    path.display()
                ),
            ));
        }
    };

    let mut df = sort_canonical(df)?;
    attrs.chunking = Some(match chunks.level {
        Some(level) if has_column(&df, LEVEL_AXIS) => vec![chunks.time, level, chunks.lat, chunks.lon],
        _ => vec![chunks.time, chunks.lat, chunks.lon],
    });
    write_artifact(&mut df, &attrs, output, gate)
}

fn rename(input: &Path, from: &str, to: &str, output: &Path, gate: &WriteGate) -> Result<()> {
    let (mut df, mut attrs) = read_artifact(input)?;
    require_column(&df, from, "rename", input)?;
    if from != to {
        df.rename(from, to.into())?;
    }
    attrs.name = to.to_string();
    write_artifact(&mut df, &attrs, output, gate)
}

fn distinct_f64(values: &[f64]) -> usize {
    values.iter().map(|v| v.to_bits()).collect::<HashSet<u64>>().len()
}

fn inspect(input: &Path) -> Result<FieldShape> {
    let df = FrameTranscoder::read_frame(input)?;
    let axes = AxisColumns::from_frame(&df)?;
    Ok(FieldShape {
        times: axes.times.iter().collect::<BTreeSet<_>>().len(),
        levels: axes.levels.as_deref().map(distinct_f64),
        lats: distinct_f64(&axes.lats),
        lons: distinct_f64(&axes.lons),
    })
}

#[async_trait]
impl Transcoder for FrameTranscoder {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn extension(&self) -> &'static str {
        "parquet"
    }

    fn artifact_files(&self, path: &Path) -> Vec<PathBuf> {
        vec![path.to_path_buf(), Self::attributes_path(path)]
    }

    async fn normalize_format(&self, raw: &Path, input: &VariableDescriptor, output: &Path) -> Result<()> {
        let (raw, input, output) = (raw.to_path_buf(), input.clone(), output.to_path_buf());
        blocking("normalize-format", move |gate| normalize(&raw, &input, &output, gate)).await
    }

    async fn apply_unit_conversion(
        &self,
        input: &Path,
        field: &str,
        conversion: &UnitConversion,
        cmip_unit: &str,
        output: &Path,
    ) -> Result<()> {
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        let (field, conversion, cmip_unit) = (field.to_string(), conversion.clone(), cmip_unit.to_string());
        blocking("unit-convert", move |gate| {
            convert(&input, &field, &conversion, &cmip_unit, &output, gate)
        })
        .await
    }

    async fn derive_field(
        &self,
        inputs: &[(PathBuf, String)],
        recipe: &DerivedField,
        field: &str,
        output: &Path,
    ) -> Result<()> {
        let (inputs, recipe) = (inputs.to_vec(), recipe.clone());
        let (field, output) = (field.to_string(), output.to_path_buf());
        blocking("derive", move |gate| derive(&inputs, &recipe, &field, &output, gate)).await
    }

    async fn reduce_time(
        &self,
        inputs: &[PathBuf],
        field: &str,
        reducer: Reducer,
        bucket: TimeBucket,
        output: &Path,
    ) -> Result<()> {
        let (inputs, field, output) = (inputs.to_vec(), field.to_string(), output.to_path_buf());
        blocking("aggregate", move |gate| {
            reduce(&inputs, &field, reducer, bucket, &output, gate)
        }).await
    }

    async fn regrid_and_chunk(
        &self,
        input: &Path,
        grid: Option<&TargetGrid>,
        chunks: &ChunkSpec,
        output: &Path,
    ) -> Result<()> {
        let (input, grid, chunks, output) = (input.to_path_buf(), grid.cloned(), *chunks, output.to_path_buf());
        blocking("regrid-and-chunk", move |gate| {
            regrid_and_chunk(&input, grid.as_ref(), &chunks, &output, gate)
        })
        .await
    }

    async fn rename(&self, input: &Path, from: &str, to: &str, output: &Path) -> Result<()> {
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        let (from, to) = (from.to_string(), to.to_string());
        blocking("rename", move |gate| rename(&input, &from, &to, &output, gate)).await
    }

    async fn inspect(&self, input: &Path) -> Result<FieldShape> {
        let input = input.to_path_buf();
        blocking("inspect", move |_| inspect(&input)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::VariableCatalog;
    use crate::conversion::ConversionTable;
    use tempfile::TempDir;

    const DAY: i64 = 86_400;
    // 2024-06-01T00:00:00Z
    const JUNE_1: i64 = 1_717_200_000;

    fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    async fn normalized(dir: &Path, short_name: &str, csv: &str) -> PathBuf {
        let catalog = VariableCatalog::builtin();
        let raw = write_csv(dir, &format!("{short_name}.csv"), csv);
        let out = dir.join(format!("{short_name}_norm.parquet"));
        FrameTranscoder::new()
            .normalize_format(&raw, catalog.lookup(short_name).unwrap(), &out)
            .await
            .unwrap();
        out
    }

    fn values(path: &Path, column: &str) -> Vec<f64> {
        f64_values(&FrameTranscoder::read_frame(path).unwrap(), column).unwrap()
    }

    #[tokio::test]
    async fn test_normalize_renames_axes_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let csv = "valid_time,latitude,longitude,tcc\n\
                   2024-06-02T00:00:00,50.0,0.0,0.2\n\
                   2024-06-01T00:00:00,50.0,0.0,0.1\n";
        let out = normalized(temp_dir.path(), "tcc", csv).await;

        let df = FrameTranscoder::read_frame(&out).unwrap();
        assert_eq!(axis_keys(&df), vec![TIME_AXIS, LAT_AXIS, LON_AXIS]);
        assert_eq!(time_values(&df).unwrap(), vec![JUNE_1, JUNE_1 + DAY]);
        assert_eq!(values(&out, "tcc"), vec![0.1, 0.2]);

        let attrs = FrameTranscoder::read_attributes(&out).unwrap();
        assert_eq!(attrs.units, "(0 - 1)");
        assert_eq!(attrs.name, "tcc");
    }

    #[tokio::test]
    async fn test_normalize_rejects_missing_field() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = VariableCatalog::builtin();
        let raw = write_csv(temp_dir.path(), "raw.csv", "time,lat,lon,other\n0,1.0,2.0,3.0\n");
        let err = FrameTranscoder::new()
            .normalize_format(&raw, catalog.lookup("tcc").unwrap(), &temp_dir.path().join("o.parquet"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::StageFailure { ref stage, .. } if stage == "normalize-format"));
    }

    #[tokio::test]
    async fn test_multiplicative_conversion() {
        let temp_dir = TempDir::new().unwrap();
        let input = normalized(temp_dir.path(), "tcc", &format!("time,lat,lon,tcc\n{JUNE_1},50.0,0.0,0.42\n")).await;
        let output = temp_dir.path().join("tcc_pct.parquet");

        let conversion = ConversionTable::builtin().get("tcc").cloned().unwrap();
        FrameTranscoder::new()
            .apply_unit_conversion(&input, "tcc", &conversion, "%", &output)
            .await
            .unwrap();

        assert!((values(&output, "tcc")[0] - 42.0).abs() < 1e-9);
        assert_eq!(FrameTranscoder::read_attributes(&output).unwrap().units, "%");
    }

    #[tokio::test]
    async fn test_divisive_conversion() {
        let temp_dir = TempDir::new().unwrap();
        let input = normalized(temp_dir.path(), "tp", &format!("time,lat,lon,tp\n{JUNE_1},50.0,0.0,86400.0\n")).await;
        let output = temp_dir.path().join("tp_rate.parquet");

        let conversion = ConversionTable::builtin().get("tp").cloned().unwrap();
        FrameTranscoder::new()
            .apply_unit_conversion(&input, "tp", &conversion, "kg m-2 s-1", &output)
            .await
            .unwrap();

        assert_eq!(values(&output, "tp"), vec![1.0]);
        assert_eq!(FrameTranscoder::read_attributes(&output).unwrap().units, "kg m-2 s-1");
    }

    #[tokio::test]
    async fn test_magnitude_of_components() {
        let temp_dir = TempDir::new().unwrap();
        let u = normalized(temp_dir.path(), "u10", &format!("time,lat,lon,u10\n{JUNE_1},50.0,0.0,3.0\n")).await;
        let v = normalized(temp_dir.path(), "v10", &format!("time,lat,lon,v10\n{JUNE_1},50.0,0.0,4.0\n")).await;
        let output = temp_dir.path().join("wind.parquet");

        let recipe = match ConversionTable::builtin().get("sfcWind").cloned().unwrap() {
            UnitConversion::Derived(recipe) => recipe,
            other => panic!("unexpected {other:?}"),
        };
        FrameTranscoder::new()
            .derive_field(
                &[(u, "u10".to_string()), (v, "v10".to_string())],
                &recipe,
                "sfcWind",
                &output,
            )
            .await
            .unwrap();

        assert_eq!(values(&output, "sfcWind"), vec![5.0]);
        let attrs = FrameTranscoder::read_attributes(&output).unwrap();
        assert_eq!(attrs.standard_name.as_deref(), Some("wind_speed"));
        assert_eq!(attrs.long_name, "Near-Surface Wind Speed");
        assert_eq!(attrs.units, "m s-1");
        assert_eq!(attrs.fill_value, Some(1.0e20));
    }

    #[tokio::test]
    async fn test_misaligned_components_fail() {
        let temp_dir = TempDir::new().unwrap();
        let u = normalized(temp_dir.path(), "u10", &format!("time,lat,lon,u10\n{JUNE_1},50.0,0.0,3.0\n")).await;
        let v = normalized(temp_dir.path(), "v10", &format!("time,lat,lon,v10\n{JUNE_1},51.0,0.0,4.0\n")).await;

        let recipe = match ConversionTable::builtin().get("sfcWind").cloned().unwrap() {
            UnitConversion::Derived(recipe) => recipe,
            other => panic!("unexpected {other:?}"),
        };
        let err = FrameTranscoder::new()
            .derive_field(
                &[(u, "u10".to_string()), (v, "v10".to_string())],
                &recipe,
                "sfcWind",
                &temp_dir.path().join("wind.parquet"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::StageFailure { .. }));
    }

    #[tokio::test]
    async fn test_daily_max_over_hourly_partials() {
        let temp_dir = TempDir::new().unwrap();
        let day1 = normalized(
            temp_dir.path(),
            "t2m",
            &format!("time,lat,lon,t2m\n{},50.0,0.0,280.0\n{},50.0,0.0,290.0\n", JUNE_1, JUNE_1 + 3600),
        )
        .await;
        let day2_raw = write_csv(
            temp_dir.path(),
            "t2m_day2.csv",
            &format!("time,lat,lon,t2m\n{},50.0,0.0,285.0\n{},50.0,0.0,283.0\n", JUNE_1 + DAY, JUNE_1 + DAY + 7200),
        );
        let day2 = temp_dir.path().join("t2m_day2.parquet");
        FrameTranscoder::new()
            .normalize_format(&day2_raw, VariableCatalog::builtin().lookup("t2m").unwrap(), &day2)
            .await
            .unwrap();

        let output = temp_dir.path().join("daily.parquet");
        FrameTranscoder::new()
            .reduce_time(&[day2, day1], "t2m", Reducer::Max, TimeBucket::Day, &output)
            .await
            .unwrap();

        let df = FrameTranscoder::read_frame(&output).unwrap();
        assert_eq!(time_values(&df).unwrap(), vec![JUNE_1, JUNE_1 + DAY]);
        assert_eq!(values(&output, "t2m"), vec![290.0, 285.0]);
        assert_eq!(FrameTranscoder::read_attributes(&output).unwrap().units, "K");
    }

    #[tokio::test]
    async fn test_monthly_mean() {
        let temp_dir = TempDir::new().unwrap();
        let daily = normalized(
            temp_dir.path(),
            "t2m",
            &format!(
                "time,lat,lon,t2m\n{},50.0,0.0,280.0\n{},50.0,0.0,290.0\n{},50.0,0.0,300.0\n",
                JUNE_1,
                JUNE_1 + DAY,
                JUNE_1 + 2 * DAY
            ),
        )
        .await;
        let output = temp_dir.path().join("monthly.parquet");
        FrameTranscoder::new()
            .reduce_time(&[daily], "t2m", Reducer::Mean, TimeBucket::Month, &output)
            .await
            .unwrap();

        let df = FrameTranscoder::read_frame(&output).unwrap();
        assert_eq!(time_values(&df).unwrap(), vec![JUNE_1]);
        assert_eq!(values(&output, "t2m"), vec![290.0]);
    }

    #[tokio::test]
    async fn test_regular_regrid_averages_cells() {
        let temp_dir = TempDir::new().unwrap();
        let input = normalized(
            temp_dir.path(),
            "t2m",
            &format!(
                "time,lat,lon,t2m\n{t},50.25,0.25,1.0\n{t},50.25,0.75,2.0\n{t},49.75,0.25,3.0\n{t},49.75,0.75,6.0\n",
                t = JUNE_1
            ),
        )
        .await;
        let output = temp_dir.path().join("regridded.parquet");
        let grid = TargetGrid::Regular {
            lat_first: 50.0,
            lat_inc: 1.0,
            lat_count: 1,
            lon_first: 0.5,
            lon_inc: 1.0,
            lon_count: 1,
        };
        let chunks = ChunkSpec {
            time: 1,
            level: None,
            lat: 46,
            lon: 22,
        };

        FrameTranscoder::new()
            .regrid_and_chunk(&input, Some(&grid), &chunks, &output)
            .await
            .unwrap();

        assert_eq!(values(&output, "t2m"), vec![3.0]);
        assert_eq!(values(&output, LAT_AXIS), vec![50.0]);
        assert_eq!(values(&output, LON_AXIS), vec![0.5]);
        let attrs = FrameTranscoder::read_attributes(&output).unwrap();
        assert_eq!(attrs.chunking, Some(vec![1, 46, 22]));
    }

    #[tokio::test]
    async fn test_rename_and_inspect() {
        let temp_dir = TempDir::new().unwrap();
        let input = normalized(
            temp_dir.path(),
            "t2m",
            &format!(
                "time,lat,lon,t2m\n{t},50.0,0.0,1.0\n{t},50.0,1.0,1.0\n{u},50.0,0.0,1.0\n{u},50.0,1.0,1.0\n",
                t = JUNE_1,
                u = JUNE_1 + DAY
            ),
        )
        .await;
        let output = temp_dir.path().join("tas.parquet");
        let transcoder = FrameTranscoder::new();
        transcoder.rename(&input, "t2m", "tas", &output).await.unwrap();

        let df = FrameTranscoder::read_frame(&output).unwrap();
        assert!(has_column(&df, "tas"));
        assert!(!has_column(&df, "t2m"));
        assert_eq!(FrameTranscoder::read_attributes(&output).unwrap().name, "tas");

        let shape = transcoder.inspect(&output).await.unwrap();
        assert_eq!(
            shape,
            FieldShape {
                times: 2,
                levels: None,
                lats: 1,
                lons: 2
            }
        );
        assert_eq!(
            transcoder.artifact_files(&output),
            vec![output.clone(), temp_dir.path().join("tas.parquet.attrs.json")]
        );
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_start(JUNE_1 + 23 * 3600, TimeBucket::Day).unwrap(), JUNE_1);
        assert_eq!(bucket_start(JUNE_1 + 29 * DAY, TimeBucket::Month).unwrap(), JUNE_1);
        assert_eq!(parse_time("2024-06-01"), Some(JUNE_1));
    }

    fn small_frame() -> DataFrame {
        DataFrame::new(vec![
            Column::new(TIME_AXIS.into(), vec![JUNE_1]),
            Column::new(LAT_AXIS.into(), vec![50.0]),
            Column::new(LON_AXIS.into(), vec![0.0]),
            Column::new("tas".into(), vec![290.0]),
        ])
        .unwrap()
    }

    #[test]
    fn test_closed_gate_refuses_to_write() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("removed/out.parquet");
        let gate = WriteGate::default();
        gate.close();

        let result = write_artifact(&mut small_frame(), &FieldAttributes::default(), &output, &gate);
        assert!(matches!(result, Err(ProcessorError::Cancelled { .. })));
        assert!(!output.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_abandoned_stage_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("work/out.parquet");
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<bool>();

        let target = output.clone();
        let stage = blocking("rename", move |gate| {
            // Still encoding when the stage is dropped
            let _ = release_rx.recv();
            let result = write_artifact(&mut small_frame(), &FieldAttributes::default(), &target, gate);
            let _ = done_tx.send(result.is_err());
            result
        });
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), stage)
                .await
                .is_err()
        );

        release_tx.send(()).unwrap();
        let refused = task::spawn_blocking(move || done_rx.recv().unwrap())
            .await
            .unwrap();
        assert!(refused);
        assert!(!output.exists());
        assert!(!output.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_completed_stage_writes_through_gate() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("day/out.parquet");
        let target = output.clone();
        blocking("rename", move |gate| {
            write_artifact(&mut small_frame(), &FieldAttributes::default(), &target, gate)
        })
        .await
        .unwrap();

        assert_eq!(values(&output, "tas"), vec![290.0]);
        assert!(FrameTranscoder::attributes_path(&output).is_file());
    }
}
