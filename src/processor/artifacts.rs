//! Bookkeeping of intermediate artifacts inside one unit's work directory.

use crate::transcoder::Transcoder;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Tracks which intermediates are alive and deletes them once consumed
pub struct ArtifactLedger<'a> {
    transcoder: &'a dyn Transcoder,
    live: Vec<PathBuf>,
    fetched: Vec<PathBuf>,
}

impl<'a> ArtifactLedger<'a> {
    pub fn new(transcoder: &'a dyn Transcoder) -> Self {
        Self {
            transcoder,
            live: Vec::new(),
            fetched: Vec::new(),
        }
    }

    pub fn produced(&mut self, path: &Path) {
        self.live.push(path.to_path_buf());
    }

    /// Raw source file acquired for this unit
    pub fn fetched(&mut self, path: &Path) {
        if !self.fetched.iter().any(|p| p == path) {
            self.fetched.push(path.to_path_buf());
        }
    }

    /// Delete artifacts whose successor has been written
    pub async fn consumed(&mut self, paths: &[PathBuf]) {
        for path in paths {
            remove_artifact(self.transcoder, path).await;
            self.live.retain(|p| p != path);
        }
    }

    pub fn live(&self) -> &[PathBuf] {
        &self.live
    }

    pub fn into_fetched(self) -> Vec<PathBuf> {
        self.fetched
    }
}

/// Remove every file backing the artifact at `path`
pub async fn remove_artifact(transcoder: &dyn Transcoder, path: &Path) {
    for file in transcoder.artifact_files(path) {
        match fs::remove_file(&file).await {
            Ok(()) => debug!("Removed {}", file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
        }
    }
}
