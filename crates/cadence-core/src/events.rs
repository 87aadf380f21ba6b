//! Project lifecycle events.

use crate::ids::BuildId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phases of a project's scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Stopped,
    Idle,
    Waiting,
    Paused,
    Queued,
    Bootstrapping,
    ModificationCheck,
    Building,
    MergingLogs,
    Publishing,
}

impl ProjectState {
    pub fn description(&self) -> &'static str {
        match self {
            ProjectState::Stopped => "stopped",
            ProjectState::Idle => "idle",
            ProjectState::Waiting => "waiting for next time to build",
            ProjectState::Paused => "paused",
            ProjectState::Queued => "in build queue",
            ProjectState::Bootstrapping => "bootstrapping",
            ProjectState::ModificationCheck => "checking for modifications",
            ProjectState::Building => "now building",
            ProjectState::MergingLogs => "merging accumulated log files",
            ProjectState::Publishing => "publishing build results",
        }
    }

    /// True while a build is between dequeue and completion.
    pub fn is_building(&self) -> bool {
        matches!(
            self,
            ProjectState::Bootstrapping
                | ProjectState::ModificationCheck
                | ProjectState::Building
                | ProjectState::MergingLogs
                | ProjectState::Publishing
        )
    }
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// All events emitted by projects and the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectEvent {
    ProjectAdded(ProjectPayload),
    ProjectRemoved(ProjectPayload),
    BuildProgress(BuildProgressPayload),
    BuildResult(BuildResultPayload),
}

impl ProjectEvent {
    pub fn project(&self) -> &str {
        match self {
            ProjectEvent::ProjectAdded(p) | ProjectEvent::ProjectRemoved(p) => &p.project,
            ProjectEvent::BuildProgress(p) => &p.project,
            ProjectEvent::BuildResult(p) => &p.project,
        }
    }

    /// Dotted subject for routing, mirroring message-bus naming.
    pub fn subject(&self) -> String {
        match self {
            ProjectEvent::ProjectAdded(p) => format!("project.{}.added", p.project),
            ProjectEvent::ProjectRemoved(p) => format!("project.{}.removed", p.project),
            ProjectEvent::BuildProgress(p) => format!("project.{}.progress", p.project),
            ProjectEvent::BuildResult(p) => format!("project.{}.result", p.project),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub project: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgressPayload {
    pub project: String,
    pub state: ProjectState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResultPayload {
    pub project: String,
    pub build_id: BuildId,
    pub label: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}
