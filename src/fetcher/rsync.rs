//! Fetcher copying from the remote pool with `rsync`.

use super::{FetchRequest, Fetcher, matching_files};
use crate::command::{CommandRunner, ToolCommand};
use crate::error::{ProcessorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct RsyncFetcher {
    runner: Arc<dyn CommandRunner>,
    host: String,
    origin: PathBuf,
}

impl RsyncFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, host: impl Into<String>, origin: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            host: host.into(),
            origin: origin.into(),
        }
    }

    fn command(&self, request: &FetchRequest, dest_dir: &Path) -> ToolCommand {
        let remote = format!(
            "{}:{}/{}.*",
            self.host,
            request.pool_dir(&self.origin).display(),
            request.file_stem()
        );
        ToolCommand::new("rsync")
            .arg("-a")
            .arg(remote)
            .arg(format!("{}/", dest_dir.display()))
    }
}

#[async_trait]
impl Fetcher for RsyncFetcher {
    async fn acquire(&self, request: &FetchRequest, dest_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        let stem = request.file_stem();
        let existing = matching_files(dest_dir, &stem);

        if !overwrite {
            if let Some(path) = existing.into_iter().next() {
                debug!("Reusing local copy {}", path.display());
                return Ok(path);
            }
        } else {
            for path in existing {
                tokio::fs::remove_file(&path).await?;
            }
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        info!("Fetching {} from {}", request, self.host);

        self.runner
            .run("fetch", &self.command(request, dest_dir))
            .await
            .map_err(|e| ProcessorError::FetchFailure {
                source_spec: stem.clone(),
                reason: e.to_string(),
            })?;

        matching_files(dest_dir, &stem)
            .into_iter()
            .next()
            .ok_or_else(|| ProcessorError::FetchFailure {
                source_spec: stem,
                reason: format!("no file arrived in {}", dest_dir.display()),
            })
    }
}
