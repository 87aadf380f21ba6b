//! Built-in change sources.

use async_trait::async_trait;
use cadence_core::build::{BuildProperties, Modification};
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::SourceControl;
use cadence_core::{Error, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Reports files under a directory whose modification time falls in the
/// queried window, and files that disappeared since the previous check.
pub struct FileSystemSource {
    root: PathBuf,
    modified_property: String,
    removed_property: String,
    seen: Mutex<Option<BTreeSet<PathBuf>>>,
    last_properties: Mutex<BuildProperties>,
}

impl FileSystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modified_property: "filemodified".to_string(),
            removed_property: "fileremoved".to_string(),
            seen: Mutex::new(None),
            last_properties: Mutex::new(BuildProperties::new()),
        }
    }

    /// Parameters: `path` (required), `property`, `property_on_delete`.
    pub fn from_spec(spec: &PluginSpec) -> Result<Self> {
        let mut source = Self::new(spec.require_str("path")?);
        if let Some(p) = spec.get_str("property") {
            source.modified_property = p;
        }
        if let Some(p) = spec.get_str("property_on_delete") {
            source.removed_property = p;
        }
        Ok(source)
    }

    fn scan(root: &Path) -> Result<Vec<(PathBuf, NaiveDateTime)>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    let modified: DateTime<Local> = meta.modified()?.into();
                    files.push((entry.path(), modified.naive_local()));
                }
            }
        }
        Ok(files)
    }

    fn to_modification(&self, path: &Path, kind: &str, at: NaiveDateTime) -> Modification {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut modification = Modification::new(file_name, "filesystem", at).with_kind(kind);
        modification.folder_name = relative
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty());
        modification
    }
}

#[async_trait]
impl SourceControl for FileSystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn get_modifications(
        &self,
        since: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Vec<Modification>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(|e| Error::SourceControl(format!("filesystem scan aborted: {}", e)))??;

        let mut modifications: Vec<Modification> = files
            .iter()
            .filter(|(_, mtime)| *mtime > since && *mtime <= now)
            .map(|(path, mtime)| self.to_modification(path, "modified", *mtime))
            .collect();
        let any_modified = !modifications.is_empty();

        let current: BTreeSet<PathBuf> = files.into_iter().map(|(p, _)| p).collect();
        let mut any_removed = false;
        {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| Error::Internal("filesystem source lock poisoned".into()))?;
            if let Some(previous) = seen.as_ref() {
                for gone in previous.difference(&current) {
                    modifications.push(self.to_modification(gone, "deleted", now));
                    any_removed = true;
                }
            }
            *seen = Some(current);
        }

        let mut props = BuildProperties::new();
        if any_modified {
            props.insert(self.modified_property.clone(), "true".into());
        }
        if any_removed {
            props.insert(self.removed_property.clone(), "true".into());
        }
        if let Ok(mut last) = self.last_properties.lock() {
            *last = props;
        }

        debug!(
            root = %self.root.display(),
            count = modifications.len(),
            "Scanned filesystem for modifications"
        );
        Ok(modifications)
    }

    fn properties(&self) -> BuildProperties {
        self.last_properties
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

/// Always reports a single change, for projects that build on every tick.
#[derive(Debug, Clone)]
pub struct AlwaysChanged {
    user: String,
}

impl AlwaysChanged {
    pub fn from_spec(spec: &PluginSpec) -> Self {
        Self {
            user: spec.get_str("user").unwrap_or_else(|| "cadence".to_string()),
        }
    }
}

#[async_trait]
impl SourceControl for AlwaysChanged {
    fn name(&self) -> &str {
        "always"
    }

    async fn get_modifications(
        &self,
        since: NaiveDateTime,
        _now: NaiveDateTime,
    ) -> Result<Vec<Modification>> {
        // Stamped at the window start so the quiet period never holds it back.
        let mut modification = Modification::new("(always)", self.user.clone(), since);
        modification.comment = "scheduled build".to_string();
        Ok(vec![modification])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_reports_files_in_window_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.c"), "int main;").unwrap();
        std::fs::write(dir.path().join("README"), "hi").unwrap();

        let source = FileSystemSource::new(dir.path());
        let now = cadence_core::time::now() + Duration::seconds(5);
        let since = now - Duration::hours(1);

        let mods = source.get_modifications(since, now).await.unwrap();
        assert_eq!(mods.len(), 2);
        let paths: BTreeSet<String> = mods.iter().map(|m| m.full_path()).collect();
        assert!(paths.contains("src/main.c"));
        assert!(paths.contains("README"));
        assert_eq!(
            source.properties().get("filemodified").map(String::as_str),
            Some("true")
        );

        std::fs::remove_file(dir.path().join("README")).unwrap();
        let mods = source.get_modifications(now, now).await.unwrap();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].kind, "deleted");
        let props = source.properties();
        assert_eq!(props.get("fileremoved").map(String::as_str), Some("true"));
        assert!(!props.contains_key("filemodified"));
    }

    #[tokio::test]
    async fn test_nothing_outside_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let source = FileSystemSource::new(dir.path());
        let now = cadence_core::time::now() + Duration::hours(2);
        let mods = source
            .get_modifications(now - Duration::hours(1), now)
            .await
            .unwrap();
        assert!(mods.is_empty());
        assert!(source.properties().is_empty());
    }

    #[tokio::test]
    async fn test_always_changed() {
        let source = AlwaysChanged::from_spec(&PluginSpec::new("always"));
        let now = cadence_core::time::now();
        let mods = source
            .get_modifications(now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].modified_time, now - Duration::minutes(5));
    }
}
