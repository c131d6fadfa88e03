//! Fetcher reading from a locally mounted copy of the pool.

use super::{FetchRequest, Fetcher, matching_files};
use crate::error::{ProcessorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MirrorFetcher {
    root: PathBuf,
}

impl MirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Fetcher for MirrorFetcher {
    async fn acquire(&self, request: &FetchRequest, dest_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        let stem = request.file_stem();

        if !overwrite {
            if let Some(path) = matching_files(dest_dir, &stem).into_iter().next() {
                debug!("Reusing local copy {}", path.display());
                return Ok(path);
            }
        }

        let pool_dir = request.pool_dir(&self.root);
        let source = matching_files(&pool_dir, &stem)
            .into_iter()
            .next()
            .ok_or_else(|| ProcessorError::FetchFailure {
                source_spec: stem.clone(),
                reason: format!("not found in {}", pool_dir.display()),
            })?;

        let file_name = source.file_name().ok_or_else(|| ProcessorError::FetchFailure {
            source_spec: stem.clone(),
            reason: format!("invalid source path {}", source.display()),
        })?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(file_name);
        info!("Copying {} from mirror", request);
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|e| ProcessorError::FetchFailure {
                source_spec: stem,
                reason: e.to_string(),
            })?;

        Ok(target)
    }
}
