//! Reanalysis Processor Library
//!
//! Converts ERA5 and CERRA reanalysis fields from the DKRZ pool into a
//! CMIP-style archive of daily and monthly files.
//!
//! The pipeline works on (variable, year, month) units. Each unit is
//! fetched, normalized, unit-converted, aggregated to daily values when the
//! source is sub-daily, regridded and chunked, renamed to its CMIP variable
//! and finally averaged to a monthly mean. Checkpoints make reruns
//! idempotent.

pub mod catalog;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod constants;
pub mod conversion;
pub mod error;
pub mod fetcher;
pub mod layout;
pub mod models;
pub mod processor;
pub mod transcoder;

// CLI modules
pub mod cli {
    pub mod args;
    pub mod commands;
}

// Re-export commonly used types
pub use catalog::VariableCatalog;
pub use checkpoint::{
    CheckpointKey, CheckpointState, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use config::{Backend, MonthList, PipelineConfig, StoreKind};
pub use conversion::{ConversionPlan, ConversionTable, UnitConversion};
pub use error::{ProcessorError, Result};
pub use layout::ArchiveLayout;
pub use models::{RunSummary, UnitOutcome, VariableDescriptor, WorkUnit};
pub use processor::PipelineEngine;
pub use processor::driver::RunDriver;
