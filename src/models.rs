//! Core data structures and types for reanalysis processing.
//!
//! Defines variable metadata, work units, the calendar rules they obey,
//! and the outcome/statistics types reported by the pipeline.

use crate::checkpoint::CheckpointKey;
use crate::error::{ProcessorError, Result};
use crate::layout::ArchiveLayout;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Level type of a source field in the archive pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    Surface,
    PressureLevel,
}

impl SourceFamily {
    /// Directory and file-name token used by the DKRZ pool (`sf` / `pl`)
    pub fn pool_token(&self) -> &'static str {
        match self {
            SourceFamily::Surface => "sf",
            SourceFamily::PressureLevel => "pl",
        }
    }
}

/// Whether a parameter is archived as analysis or forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    Analysis,
    Forecast,
}

impl Product {
    pub fn pool_dir(&self) -> &'static str {
        match self {
            Product::Analysis => "an",
            Product::Forecast => "fc",
        }
    }

    /// Type id embedded in pool file names
    pub fn type_id(&self) -> &'static str {
        match self {
            Product::Analysis => "00",
            Product::Forecast => "12",
        }
    }
}

/// Temporal resolution of the source files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// One file per month holding daily values
    Daily,
    /// One file per day holding hourly values
    Hourly,
    /// One file per month holding three-hourly values
    ThreeHourly,
}

impl Frequency {
    pub fn pool_token(&self) -> &'static str {
        match self {
            Frequency::Daily => "1D",
            Frequency::Hourly => "1H",
            Frequency::ThreeHourly => "3H",
        }
    }

    pub fn is_sub_daily(&self) -> bool {
        !matches!(self, Frequency::Daily)
    }

    /// Sources that arrive as one file per calendar day
    pub fn has_daily_files(&self) -> bool {
        matches!(self, Frequency::Hourly)
    }
}

/// Time reduction operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    #[default]
    Mean,
    Min,
    Max,
}

impl Reducer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reducer::Mean => "mean",
            Reducer::Min => "min",
            Reducer::Max => "max",
        }
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reanalysis product a run belongs to; the `{source}` token of archive names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    Era5,
    Cerra,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Era5 => "era5",
            DataSource::Cerra => "cerra",
        }
    }
}

/// Archive time granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Day,
    Mon,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Mon => "mon",
        }
    }
}

/// Physical metadata of one catalog variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub short_name: String,
    pub long_name: String,
    pub source_param_id: u32,
    pub native_unit: String,
    pub product: Product,
    pub cmip_name: String,
    pub cmip_unit: String,
    pub family: SourceFamily,
    pub frequency: Frequency,
    /// Computed from other variables rather than read from one source field
    pub derived: bool,
    /// Raw fields this variable is built from
    pub inputs: Vec<String>,
    pub reducer: Reducer,
}

impl VariableDescriptor {
    pub fn needs_unit_conversion(&self) -> bool {
        self.native_unit != self.cmip_unit
    }

    /// Name of the data variable inside intermediate artifacts before renaming
    pub fn field_name(&self) -> &str {
        if self.derived {
            &self.short_name
        } else {
            self.inputs
                .first()
                .map(String::as_str)
                .unwrap_or(&self.short_name)
        }
    }
}

/// Number of days in a calendar month, `None` for an invalid month
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next.signed_duration_since(first).num_days() as u32)
}

/// One granule of pipeline work
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub variable: VariableDescriptor,
    pub year: i32,
    pub month: u32,
    pub day: Option<u32>,
    /// Directory the raw source files of this variable are fetched into
    pub source_path: PathBuf,
    /// Directory private to this unit for intermediate artifacts
    pub working_path: PathBuf,
    /// Final daily archive file
    pub archive_path: PathBuf,
}

impl WorkUnit {
    /// Create the monthly unit for `variable` with paths resolved by `layout`
    pub fn new(
        variable: VariableDescriptor,
        year: i32,
        month: u32,
        layout: &ArchiveLayout,
    ) -> Result<Self> {
        if days_in_month(year, month).is_none() {
            return Err(ProcessorError::InvalidWorkUnit {
                year,
                month,
                reason: "month must be within 1-12".to_string(),
            });
        }

        Ok(Self {
            source_path: layout.download_dir(&variable.short_name),
            working_path: layout.work_dir(&variable.short_name, year, month),
            archive_path: layout.archive_path(&variable.cmip_name, Granularity::Day, year, month),
            variable,
            year,
            month,
            day: None,
        })
    }

    /// Derive the sub-daily step for `day` of this unit's month
    pub fn with_day(&self, day: u32) -> Result<Self> {
        let days = self.days_in_month();
        if day == 0 || day > days {
            return Err(ProcessorError::InvalidWorkUnit {
                year: self.year,
                month: self.month,
                reason: format!("day {day} outside 1-{days}"),
            });
        }
        Ok(Self {
            day: Some(day),
            ..self.clone()
        })
    }

    pub fn days_in_month(&self) -> u32 {
        // Validated in `new`
        days_in_month(self.year, self.month).unwrap_or(0)
    }

    pub fn is_sub_daily_step(&self) -> bool {
        self.day.is_some()
    }

    pub fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey::new(self.year, self.month, &self.variable.short_name)
    }

    /// `YYYYMM` or `YYYYMMDD` token used in intermediate file names
    pub fn date_token(&self) -> String {
        match self.day {
            Some(day) => format!("{}{:02}{:02}", self.year, self.month, day),
            None => format!("{}{:02}", self.year, self.month),
        }
    }

    /// First calendar day of the unit
    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day.unwrap_or(1))
    }

    /// Whether the unit's month lies entirely in the future relative to `today`
    pub fn is_after(&self, today: NaiveDate) -> bool {
        (self.year, self.month) > (today.year(), today.month())
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{:02}",
            self.variable.short_name, self.year, self.month
        )?;
        if let Some(day) = self.day {
            write!(f, "-{day:02}")?;
        }
        Ok(())
    }
}

/// Result of driving one work unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// All stages ran; daily and monthly archive files were written
    Completed { archive: PathBuf, monthly: PathBuf },
    /// A Completed checkpoint already existed; nothing was executed
    AlreadyComplete { archive: PathBuf },
    /// A Started checkpoint exists and resuming partial units is disabled
    SkippedPartial,
}

impl UnitOutcome {
    pub fn archive_path(&self) -> Option<&PathBuf> {
        match self {
            UnitOutcome::Completed { archive, .. } | UnitOutcome::AlreadyComplete { archive } => {
                Some(archive)
            }
            UnitOutcome::SkippedPartial => None,
        }
    }
}

/// Processing statistics for a whole run
#[derive(Debug, Default)]
pub struct RunSummary {
    pub units_completed: usize,
    pub units_already_complete: usize,
    pub units_skipped: usize,
    /// (unit, reason) of every failed unit
    pub failures: Vec<(String, String)>,
    pub processing_time_ms: u128,
}

impl RunSummary {
    pub fn units_failed(&self) -> usize {
        self.failures.len()
    }

    pub fn record(&mut self, unit: &WorkUnit, result: &Result<UnitOutcome>) {
        match result {
            Ok(UnitOutcome::Completed { .. }) => self.units_completed += 1,
            Ok(UnitOutcome::AlreadyComplete { .. }) => self.units_already_complete += 1,
            Ok(UnitOutcome::SkippedPartial) => self.units_skipped += 1,
            Err(e) => self.failures.push((unit.to_string(), e.to_string())),
        }
    }
}
