//! Numerical transformation kernels.
//!
//! A [`Transcoder`] turns one artifact into another: format normalization,
//! unit conversion, derived fields, time reduction, regridding with chunked
//! layout, and variable renaming. The engine only sees paths; the on-disk
//! representation belongs to the backend.

pub mod cdo;
pub mod frame;

pub use cdo::CdoTranscoder;
pub use frame::{FieldAttributes, FrameTranscoder};

use crate::conversion::{DerivedField, UnitConversion};
use crate::error::Result;
use crate::models::{Reducer, VariableDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Target of the regridding step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetGrid {
    /// CDO grid description file
    File { path: PathBuf },
    /// Regular lat/lon grid given by first cell centre, increment and count
    Regular {
        lat_first: f64,
        lat_inc: f64,
        lat_count: usize,
        lon_first: f64,
        lon_inc: f64,
        lon_count: usize,
    },
}

impl TargetGrid {
    /// CDO `griddes` text of a regular grid
    pub fn griddes(&self) -> Option<String> {
        match self {
            TargetGrid::File { .. } => None,
            TargetGrid::Regular {
                lat_first,
                lat_inc,
                lat_count,
                lon_first,
                lon_inc,
                lon_count,
            } => Some(format!(
                "gridtype = lonlat\nxsize    = {lon_count}\nysize    = {lat_count}\nxfirst   = {lon_first}\nxinc     = {lon_inc}\nyfirst   = {lat_first}\nyinc     = {lat_inc}\n"
            )),
        }
    }
}

/// Chunk lengths of the archived layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub time: usize,
    /// Level chunk, set for pressure-level fields
    pub level: Option<usize>,
    pub lat: usize,
    pub lon: usize,
}

impl ChunkSpec {
    pub fn elements(&self) -> usize {
        self.time * self.level.unwrap_or(1) * self.lat * self.lon
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Day,
    Month,
}

/// Axis sizes of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldShape {
    pub times: usize,
    /// `None` for fields without a vertical axis
    pub levels: Option<usize>,
    pub lats: usize,
    pub lons: usize,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extension of artifacts written by this backend
    fn extension(&self) -> &'static str;

    /// Every file backing the artifact at `path`
    fn artifact_files(&self, path: &Path) -> Vec<PathBuf> {
        vec![path.to_path_buf()]
    }

    /// Convert a raw source file into the canonical form with axes time/lat/lon
    async fn normalize_format(&self, raw: &Path, input: &VariableDescriptor, output: &Path) -> Result<()>;

    /// Apply a scaling or relabel branch and set the unit attribute to `cmip_unit`
    async fn apply_unit_conversion(
        &self,
        input: &Path,
        field: &str,
        conversion: &UnitConversion,
        cmip_unit: &str,
        output: &Path,
    ) -> Result<()>;

    /// Compute a derived field from aligned inputs given as (path, field name)
    async fn derive_field(
        &self,
        inputs: &[(PathBuf, String)],
        recipe: &DerivedField,
        field: &str,
        output: &Path,
    ) -> Result<()>;

    /// Concatenate `inputs` along time and reduce every bucket with `reducer`
    async fn reduce_time(
        &self,
        inputs: &[PathBuf],
        field: &str,
        reducer: Reducer,
        bucket: TimeBucket,
        output: &Path,
    ) -> Result<()>;

    /// Regrid onto `grid` when given, then write the chunked layout
    async fn regrid_and_chunk(
        &self,
        input: &Path,
        grid: Option<&TargetGrid>,
        chunks: &ChunkSpec,
        output: &Path,
    ) -> Result<()>;

    async fn rename(&self, input: &Path, from: &str, to: &str, output: &Path) -> Result<()>;

    async fn inspect(&self, input: &Path) -> Result<FieldShape>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_griddes() {
        let grid = TargetGrid::Regular {
            lat_first: -89.5,
            lat_inc: 1.0,
            lat_count: 180,
            lon_first: 0.5,
            lon_inc: 1.0,
            lon_count: 360,
        };
        let text = grid.griddes().unwrap();
        assert!(text.starts_with("gridtype = lonlat\n"));
        assert!(text.contains("xsize    = 360"));
        assert!(text.contains("yfirst   = -89.5"));

        let file = TargetGrid::File {
            path: PathBuf::from("grid_1x1.txt"),
        };
        assert!(file.griddes().is_none());
    }

    #[test]
    fn test_grid_from_yaml() {
        let grid: TargetGrid = serde_yaml::from_str("file:\n  path: /grids/n96.txt\n").unwrap();
        assert_eq!(
            grid,
            TargetGrid::File {
                path: PathBuf::from("/grids/n96.txt")
            }
        );
    }

    #[test]
    fn test_chunk_elements() {
        let chunks = ChunkSpec {
            time: 1,
            level: Some(37),
            lat: 46,
            lon: 22,
        };
        assert_eq!(chunks.elements(), 37 * 46 * 22);
    }
}
