//! Versioned on-disk record of a project's scheduling history.

use cadence_core::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume scheduling a project after a restart.
/// Live resources (schedule, sources, plugins) are re-attached from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub version: u32,
    pub name: String,
    pub label: String,
    pub last_build: NaiveDateTime,
    pub last_successful_build: NaiveDateTime,
    pub last_build_successful: bool,
    pub build_counter: u64,
    pub paused: bool,
    pub build_forced: bool,
}

impl ProjectSnapshot {
    /// Percent-encodes every byte outside `[A-Za-z0-9._-]`, so distinct
    /// project names never share a file.
    pub fn file_name(name: &str) -> String {
        let mut safe = String::with_capacity(name.len() + 5);
        for byte in name.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                    safe.push(byte as char)
                }
                other => safe.push_str(&format!("%{:02X}", other)),
            }
        }
        safe.push_str(".json");
        safe
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(Self::file_name(&self.name))
    }

    /// Write atomically into `dir`.
    pub async fn save(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = self.path_in(dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(project = %self.name, path = %path.display(), "Snapshot saved");
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Self = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Serialization(format!(
                "{}: unsupported snapshot version {}",
                path.display(),
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Load the snapshot for `name` from `dir`, if one exists.
    pub async fn load_named(dir: &Path, name: &str) -> Result<Option<Self>> {
        let path = dir.join(Self::file_name(name));
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let snapshot = Self::load(&path).await?;
        if snapshot.name != name {
            warn!(
                path = %path.display(),
                expected = %name,
                found = %snapshot.name,
                "Snapshot belongs to another project, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Every readable snapshot in `dir`. Unreadable files are skipped.
    pub async fn load_all(dir: &Path) -> Result<Vec<Self>> {
        let mut snapshots = Vec::new();
        if !tokio::fs::try_exists(dir).await? {
            return Ok(snapshots);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load(&path).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}
