//! Error handling for reanalysis processing operations.
//!
//! Provides the failure taxonomy of the normalization pipeline. Every variant
//! is local to one work unit unless [`ProcessorError::is_fatal`] says the whole
//! run has to stop.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unknown variable: {short_name}")]
    UnknownVariable { short_name: String },

    #[error("Failed to load variable catalog from {path}: {reason}")]
    CatalogLoad { path: PathBuf, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unsupported variable {short_name}: {reason}")]
    UnsupportedVariable { short_name: String, reason: String },

    #[error(
        "Unit conversion for {short_name} from '{native_unit}' to '{cmip_unit}' is not implemented"
    )]
    UnsupportedUnitConversion {
        short_name: String,
        native_unit: String,
        cmip_unit: String,
    },

    #[error("Invalid work unit {year}-{month:02}: {reason}")]
    InvalidWorkUnit { year: i32, month: u32, reason: String },

    #[error("Fetch failed for {source_spec}: {reason}")]
    FetchFailure { source_spec: String, reason: String },

    #[error(
        "Incomplete aggregation for {key}: expected {expected} days, got {received} (missing days {missing:?}, failed days {failed:?})"
    )]
    IncompleteAggregation {
        key: String,
        expected: u32,
        received: usize,
        missing: Vec<u32>,
        failed: Vec<u32>,
    },

    #[error("Stage '{stage}' failed: {reason}")]
    StageFailure { stage: String, reason: String },

    #[error("Integrity check failed for {path}: {reason}")]
    IntegrityMismatch { path: PathBuf, reason: String },

    #[error("Checkpoint {key} is held by another runner")]
    CheckpointBusy { key: String },

    #[error("Processing cancelled: {reason}")]
    Cancelled { reason: String },
}

impl ProcessorError {
    pub fn stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IntegrityMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Errors after which no further work unit can produce meaningful output
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownVariable { .. }
                | Self::CatalogLoad { .. }
                | Self::Configuration { .. }
                | Self::Cancelled { .. }
        )
    }

    /// Wrap backend errors that are not already part of the taxonomy so the
    /// failing stage is named in the report.
    pub fn within_stage(self, stage: &str) -> Self {
        match self {
            Self::Io(e) => Self::stage(stage, e.to_string()),
            Self::Frame(e) => Self::stage(stage, e.to_string()),
            Self::Json(e) => Self::stage(stage, e.to_string()),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
