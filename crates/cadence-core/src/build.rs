//! Build inputs and outputs: modifications, result documents, artifacts.

use crate::error::Error;
use crate::ids::BuildId;
use crate::plugin::PluginSpec;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Properties handed to builders. Ordered so result documents are stable.
pub type BuildProperties = BTreeMap<String, String>;

/// A single change reported by a source-control adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    #[serde(rename = "type", default = "default_modification_type")]
    pub kind: String,
    pub file_name: String,
    #[serde(default)]
    pub folder_name: Option<String>,
    pub modified_time: NaiveDateTime,
    pub user_name: String,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub comment: String,
}

fn default_modification_type() -> String {
    "unknown".to_string()
}

impl Modification {
    pub fn new(file_name: impl Into<String>, user_name: impl Into<String>, at: NaiveDateTime) -> Self {
        Self {
            kind: default_modification_type(),
            file_name: file_name.into(),
            folder_name: None,
            modified_time: at,
            user_name: user_name.into(),
            email_address: None,
            comment: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn full_path(&self) -> String {
        match &self.folder_name {
            Some(folder) if !folder.is_empty() => format!("{}/{}", folder, self.file_name),
            _ => self.file_name.clone(),
        }
    }
}

/// Why a build did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The build tool ran and failed.
    BuildFailed,
    /// No agent could be claimed for a remote build.
    NoCapacity,
    /// Results or artifacts could not be fetched from the agent.
    ArtifactTransfer,
    /// Anything else (I/O, transport).
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// The document a builder produces for one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<BuildFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    /// Extra builder-specific sections merged into the build log.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sections: BTreeMap<String, serde_json::Value>,
}

impl ResultDocument {
    pub fn success(builder: impl Into<String>) -> Self {
        Self {
            success: true,
            failure: None,
            builder: Some(builder.into()),
            agent: None,
            duration_ms: 0,
            output: Vec::new(),
            sections: BTreeMap::new(),
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            failure: Some(BuildFailure {
                kind,
                message: message.into(),
            }),
            builder: None,
            agent: None,
            duration_ms: 0,
            output: Vec::new(),
            sections: BTreeMap::new(),
        }
    }

    /// Record an error as a failed build, classifying capacity and transfer
    /// problems so they stay distinguishable from tool failures.
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            e if e.is_no_capacity() => FailureKind::NoCapacity,
            Error::ArtifactTransfer(_) => FailureKind::ArtifactTransfer,
            Error::BuildFailed(_) => FailureKind::BuildFailed,
            _ => FailureKind::Internal,
        };
        Self::failed(kind, err.to_string())
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// The merged document written after every build and handed to publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildLog {
    pub build_id: BuildId,
    pub project: String,
    /// The label this build ran with (before any increment).
    pub label: String,
    pub timestamp: NaiveDateTime,
    pub info: BuildProperties,
    pub modifications: Vec<Modification>,
    pub result: ResultDocument,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl BuildLog {
    pub fn is_successful(&self) -> bool {
        self.result.success
    }

    /// File name the log is stored under: `log<timestamp>L<label>.json` for
    /// a success, `log<timestamp>-<build id>.json` for a failure. Failures
    /// keep their label, so the build id tells them apart.
    pub fn file_name(&self) -> String {
        let stamp = crate::time::format_timestamp(&self.timestamp);
        if self.result.success {
            format!("log{}L{}.json", stamp, self.label)
        } else {
            format!("log{}-{}.json", stamp, self.build_id)
        }
    }
}

/// A named output file produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub bytes: Vec<u8>,
}

/// A build shipped to a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub build_id: BuildId,
    pub project: String,
    #[serde(default)]
    pub module: Option<String>,
    /// Builder the agent instantiates from its own plugin registry.
    pub builder: PluginSpec,
    pub properties: BuildProperties,
}

/// Where a builder may read and write while it runs.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub working_dir: Option<PathBuf>,
    /// Files written here are collected as artifacts.
    pub output_dir: Option<PathBuf>,
}
