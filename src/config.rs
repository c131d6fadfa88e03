//! Configuration management and validation.
//!
//! A run is described by one YAML document:
//! ```yaml
//! dataset: { source: era5, store: dkrz }
//! variables: [t2m, tp, tasmax]
//! time: { start_year: 1979, end_year: 2024, months: "01, 02" }
//! paths: { download: /scratch/download, work: /scratch/work, proc: /work/proc }
//! chunking: { time: 1, lat: 46, lon: 22 }
//! grid: { file: { path: /grids/era5_1x1.txt } }
//! ```
//! The document is validated once after loading and then shared read-only.

use crate::catalog::VariableCatalog;
use crate::constants::{
    CHECKPOINT_DIR_NAME, DEFAULT_LAT_CHUNK, DEFAULT_LON_CHUNK, DEFAULT_POOL_ORIGIN,
    DEFAULT_RSYNC_HOST, DEFAULT_STAGE_TIMEOUT_SECS, DEFAULT_STALE_LOCK_SECS, DEFAULT_TIME_CHUNK,
};
use crate::conversion::{ConversionTable, UnitConversion};
use crate::error::{ProcessorError, Result};
use crate::layout::ArchiveLayout;
use crate::models::DataSource;
use crate::transcoder::{ChunkSpec, TargetGrid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Where raw source files come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Remote DKRZ pool reached over rsync
    #[default]
    Dkrz,
    /// Locally mounted copy of the pool
    Mirror,
}

/// Numerical backend used for every transformation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// External CDO/NCO tools writing NetCDF
    #[default]
    Cdo,
    /// In-process polars backend writing Parquet
    Frame,
}

impl Backend {
    pub fn extension(&self) -> &'static str {
        match self {
            Backend::Cdo => "nc",
            Backend::Frame => "parquet",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetSettings {
    #[serde(default)]
    pub source: DataSource,
    #[serde(default)]
    pub store: StoreKind,
}

/// Months of the year to process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MonthsRepr", into = "Vec<u32>")]
pub struct MonthList(Vec<u32>);

#[derive(Deserialize)]
#[serde(untagged)]
enum MonthsRepr {
    List(Vec<u32>),
    Single(u32),
    Text(String),
}

impl MonthList {
    pub fn new(months: Vec<u32>) -> Result<Self> {
        if months.is_empty() {
            return Err(ProcessorError::configuration("month list is empty"));
        }
        if let Some(month) = months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ProcessorError::configuration(format!(
                "month {month} is outside 1-12"
            )));
        }
        let mut months = months;
        months.sort_unstable();
        months.dedup();
        Ok(Self(months))
    }

    pub fn all() -> Self {
        Self((1..=12).collect())
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for MonthList {
    type Err = ProcessorError;

    /// Accepts `"01, 02, 12"` as well as `"1,2,12"`
    fn from_str(s: &str) -> Result<Self> {
        let months = s
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token.parse::<u32>().map_err(|_| {
                    ProcessorError::configuration(format!("invalid month '{token}'"))
                })
            })
            .collect::<Result<Vec<u32>>>()?;
        Self::new(months)
    }
}

impl TryFrom<MonthsRepr> for MonthList {
    type Error = ProcessorError;

    fn try_from(repr: MonthsRepr) -> Result<Self> {
        match repr {
            MonthsRepr::List(months) => Self::new(months),
            MonthsRepr::Single(month) => Self::new(vec![month]),
            MonthsRepr::Text(text) => text.parse(),
        }
    }
}

impl From<MonthList> for Vec<u32> {
    fn from(months: MonthList) -> Self {
        months.0
    }
}

impl fmt::Display for MonthList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self.0.iter().map(|m| format!("{m:02}")).collect();
        f.write_str(&tokens.join(", "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_year: i32,
    pub end_year: i32,
    /// All twelve months when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub months: Option<MonthList>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Root of the source pool (remote for `dkrz`, local for `mirror`)
    #[serde(default = "default_origin")]
    pub origin: PathBuf,
    pub download: PathBuf,
    pub work: PathBuf,
    pub proc: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<PathBuf>,
}

fn default_origin() -> PathBuf {
    PathBuf::from(DEFAULT_POOL_ORIGIN)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub time: usize,
    pub lat: usize,
    pub lon: usize,
    /// Level count every pressure-level field must have
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_levels: Option<usize>,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            time: DEFAULT_TIME_CHUNK,
            lat: DEFAULT_LAT_CHUNK,
            lon: DEFAULT_LON_CHUNK,
            expected_levels: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupSettings {
    /// Delete the fetched raw files once their month is archived
    #[serde(default)]
    pub remove_sources: bool,
    /// Keep the work directory of units failing in a stage or integrity check
    #[serde(default)]
    pub keep_failed_intermediates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Retry units that have a Started marker but no Completed marker
    #[serde(default = "default_true")]
    pub resume_partial: bool,
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stale_lock_secs() -> u64 {
    DEFAULT_STALE_LOCK_SECS
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            resume_partial: true,
            stale_lock_secs: DEFAULT_STALE_LOCK_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_units: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_rsync_host")]
    pub rsync_host: String,
}

fn default_concurrency() -> usize {
    1
}

fn default_stage_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

fn default_rsync_host() -> String {
    DEFAULT_RSYNC_HOST.to_string()
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            max_concurrent_units: default_concurrency(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            rsync_host: default_rsync_host(),
        }
    }
}

/// Complete description of one processing run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dataset: DatasetSettings,
    pub variables: Vec<String>,
    pub time: TimeRange,
    pub paths: PathSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<TargetGrid>,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub cleanup: CleanupSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// JSON catalog extending the built-in variable table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
    /// Extra or overriding unit-conversion branches keyed by short name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub conversions: HashMap<String, UnitConversion>,
}

impl PipelineConfig {
    /// Configuration with every directory below `root` and no variables
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            dataset: DatasetSettings::default(),
            variables: Vec::new(),
            time: TimeRange {
                start_year: 2000,
                end_year: 2000,
                months: None,
            },
            paths: PathSettings {
                origin: root.join("pool"),
                download: root.join("download"),
                work: root.join("work"),
                proc: root.join("proc"),
                checkpoints: None,
            },
            chunking: ChunkingSettings::default(),
            grid: None,
            flags: Flags::default(),
            cleanup: CleanupSettings::default(),
            checkpoint: CheckpointSettings::default(),
            execution: ExecutionSettings::default(),
            catalog: None,
            conversions: HashMap::new(),
        }
    }

    /// Read, parse and validate a YAML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file without validating it, so overrides can still be applied
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcessorError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProcessorError::configuration(format!("invalid YAML in {}: {e}", path.display()))
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.variables.is_empty() {
            return Err(ProcessorError::configuration("no variables configured"));
        }
        if self.time.start_year > self.time.end_year {
            return Err(ProcessorError::configuration(format!(
                "start year {} is after end year {}",
                self.time.start_year, self.time.end_year
            )));
        }

        for (name, path) in [
            ("paths.download", &self.paths.download),
            ("paths.work", &self.paths.work),
            ("paths.proc", &self.paths.proc),
            ("paths.origin", &self.paths.origin),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ProcessorError::configuration(format!("{name} is not set")));
            }
        }

        let chunking = &self.chunking;
        if chunking.time == 0 || chunking.lat == 0 || chunking.lon == 0 {
            return Err(ProcessorError::configuration(
                "chunk sizes must be positive integers",
            ));
        }
        if chunking.expected_levels == Some(0) {
            return Err(ProcessorError::configuration(
                "chunking.expected_levels must be positive",
            ));
        }

        if self.execution.max_concurrent_units == 0 {
            return Err(ProcessorError::configuration(
                "execution.max_concurrent_units must be at least 1",
            ));
        }
        if self.execution.stage_timeout_secs == 0 {
            return Err(ProcessorError::configuration(
                "execution.stage_timeout_secs must be positive",
            ));
        }
        if self.execution.max_concurrent_units > num_cpus::get() {
            warn!(
                "{} concurrent units requested on {} CPUs",
                self.execution.max_concurrent_units,
                num_cpus::get()
            );
        }

        if let Some(TargetGrid::File { path }) = &self.grid {
            if self.execution.backend == Backend::Frame {
                return Err(ProcessorError::configuration(format!(
                    "grid description file {} requires the cdo backend",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    pub fn months(&self) -> Vec<u32> {
        self.time
            .months
            .clone()
            .unwrap_or_else(MonthList::all)
            .into()
    }

    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.time.start_year..=self.time.end_year
    }

    pub fn layout(&self) -> ArchiveLayout {
        ArchiveLayout::new(
            &self.paths.download,
            &self.paths.work,
            &self.paths.proc,
            self.dataset.source,
            self.execution.backend.extension(),
        )
    }

    /// Chunk lengths with the level chunk set to `levels` when present
    pub fn chunk_spec(&self, levels: Option<usize>) -> ChunkSpec {
        ChunkSpec {
            time: self.chunking.time,
            level: levels,
            lat: self.chunking.lat,
            lon: self.chunking.lon,
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.paths
            .checkpoints
            .clone()
            .unwrap_or_else(|| self.paths.work.join(CHECKPOINT_DIR_NAME))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.stage_timeout_secs)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.checkpoint.stale_lock_secs)
    }

    /// Built-in catalog extended by the configured JSON file
    pub fn load_catalog(&self) -> Result<VariableCatalog> {
        let mut catalog = VariableCatalog::builtin();
        if let Some(path) = &self.catalog {
            catalog.extend(VariableCatalog::from_json_file(path)?);
        }
        Ok(catalog)
    }

    /// Built-in conversion table extended by the configured branches
    pub fn conversion_table(&self) -> ConversionTable {
        let mut table = ConversionTable::builtin();
        table.extend(self.conversions.clone());
        table
    }

    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = variables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_years(mut self, start_year: i32, end_year: i32) -> Self {
        self.time.start_year = start_year;
        self.time.end_year = end_year;
        self
    }

    pub fn with_months(mut self, months: MonthList) -> Self {
        self.time.months = Some(months);
        self
    }

    pub fn with_source(mut self, source: DataSource) -> Self {
        self.dataset.source = source;
        self
    }

    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.dataset.store = store;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.execution.backend = backend;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.flags.overwrite = overwrite;
        self
    }

    pub fn with_grid(mut self, grid: TargetGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn with_expected_levels(mut self, levels: usize) -> Self {
        self.chunking.expected_levels = Some(levels);
        self
    }

    pub fn with_resume_partial(mut self, resume: bool) -> Self {
        self.checkpoint.resume_partial = resume;
        self
    }

    pub fn with_remove_sources(mut self, remove: bool) -> Self {
        self.cleanup.remove_sources = remove;
        self
    }

    pub fn with_keep_failed_intermediates(mut self, keep: bool) -> Self {
        self.cleanup.keep_failed_intermediates = keep;
        self
    }

    pub fn with_max_concurrent_units(mut self, units: usize) -> Self {
        self.execution.max_concurrent_units = units;
        self
    }

    pub fn with_conversion(mut self, short_name: &str, conversion: UnitConversion) -> Self {
        self.conversions.insert(short_name.to_string(), conversion);
        self
    }
}
