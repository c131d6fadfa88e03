//! Acquisition of raw source files.
//!
//! Source files follow the DKRZ ERA5 pool naming:
//! ```text
//! {origin}/{sf|pl}/{an|fc}/{1D|1H|3H}/{param:03}/
//!     E5{sf|pl}{00|12}_{freq}_{YYYY}-{MM}[-{DD}]_{param:03}.{grb|nc|...}
//! ```

pub mod mirror;
pub mod rsync;

pub use mirror::MirrorFetcher;
pub use rsync::RsyncFetcher;

use crate::error::Result;
use crate::models::{Frequency, Product, SourceFamily, VariableDescriptor, WorkUnit};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies one raw source file in the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub short_name: String,
    pub param_id: u32,
    pub product: Product,
    pub family: SourceFamily,
    pub frequency: Frequency,
    pub year: i32,
    pub month: u32,
    pub day: Option<u32>,
}

impl FetchRequest {
    /// Request for raw field `input` at the granule of `unit`
    pub fn for_input(input: &VariableDescriptor, unit: &WorkUnit) -> Self {
        Self {
            short_name: input.short_name.clone(),
            param_id: input.source_param_id,
            product: input.product,
            family: input.family,
            frequency: unit.variable.frequency,
            year: unit.year,
            month: unit.month,
            day: unit.day,
        }
    }

    /// Pool directory of the parameter below `origin`
    pub fn pool_dir(&self, origin: &Path) -> PathBuf {
        origin
            .join(self.family.pool_token())
            .join(self.product.pool_dir())
            .join(self.frequency.pool_token())
            .join(format!("{:03}", self.param_id))
    }

    /// File name without extension
    pub fn file_stem(&self) -> String {
        let date = match self.day {
            Some(day) => format!("{}-{:02}-{:02}", self.year, self.month, day),
            None => format!("{}-{:02}", self.year, self.month),
        };
        format!(
            "E5{}{}_{}_{}_{:03}",
            self.family.pool_token(),
            self.product.type_id(),
            self.frequency.pool_token(),
            date,
            self.param_id
        )
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.file_stem(), self.short_name)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Make the source file available in `dest_dir` and return its path.
    /// An existing local copy is reused unless `overwrite` is set.
    async fn acquire(&self, request: &FetchRequest, dest_dir: &Path, overwrite: bool) -> Result<PathBuf>;
}

/// Files in `dir` named `{stem}.*`, sorted
pub(crate) fn matching_files(dir: &Path, stem: &str) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/{}.*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(stem)
    );
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)
        .map(|paths| paths.filter_map(|p| p.ok()).filter(|p| p.is_file()).collect())
        .unwrap_or_default();
    matches.sort();
    matches
}
