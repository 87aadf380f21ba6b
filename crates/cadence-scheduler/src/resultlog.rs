//! Writes merged build logs under a project's log directory.

use cadence_core::Result;
use cadence_core::build::BuildLog;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `log` as pretty JSON to `dir/<log file name>`.
pub async fn write(dir: &Path, log: &BuildLog) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(log.file_name());
    tokio::fs::write(&path, serde_json::to_vec_pretty(log)?).await?;
    info!(project = %log.project, path = %path.display(), "Build log written");
    Ok(path)
}

pub async fn read(path: &Path) -> Result<BuildLog> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
