//! Deterministic directory and file naming for downloads, work areas and
//! the processed archive.
//!
//! The archive structure is fixed:
//! ```text
//! {proc}/
//!   {cmip_name}/
//!     day/native/{year}/{cmip_name}_day_{source}_{year}{MM}.{ext}
//!     mon/native/{year}/{cmip_name}_mon_{source}_{year}{MM}.{ext}
//! ```

use crate::models::{DataSource, Granularity};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    download_root: PathBuf,
    work_root: PathBuf,
    proc_root: PathBuf,
    source: DataSource,
    extension: String,
}

impl ArchiveLayout {
    pub fn new(
        download_root: &Path,
        work_root: &Path,
        proc_root: &Path,
        source: DataSource,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            download_root: download_root.to_path_buf(),
            work_root: work_root.to_path_buf(),
            proc_root: proc_root.to_path_buf(),
            source,
            extension: extension.into(),
        }
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Directory holding the archive files of one variable, granularity and year
    pub fn archive_dir(&self, cmip_name: &str, granularity: Granularity, year: i32) -> PathBuf {
        self.proc_root
            .join(cmip_name)
            .join(granularity.as_str())
            .join("native")
            .join(year.to_string())
    }

    pub fn archive_file_name(
        &self,
        cmip_name: &str,
        granularity: Granularity,
        year: i32,
        month: u32,
    ) -> String {
        format!(
            "{cmip}_{gran}_{source}_{year}{month:02}.{ext}",
            cmip = cmip_name,
            gran = granularity.as_str(),
            source = self.source.as_str(),
            ext = self.extension,
        )
    }

    pub fn archive_path(
        &self,
        cmip_name: &str,
        granularity: Granularity,
        year: i32,
        month: u32,
    ) -> PathBuf {
        self.archive_dir(cmip_name, granularity, year)
            .join(self.archive_file_name(cmip_name, granularity, year, month))
    }

    /// Download directory of one raw variable
    pub fn download_dir(&self, short_name: &str) -> PathBuf {
        self.download_root.join(short_name)
    }

    /// Work directory private to one monthly unit
    pub fn work_dir(&self, short_name: &str, year: i32, month: u32) -> PathBuf {
        self.work_root
            .join(short_name)
            .join(format!("{year}{month:02}"))
    }
}
