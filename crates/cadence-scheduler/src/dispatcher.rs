//! Runs a build locally or on a claimed remote agent and normalizes the result.

use crate::pool::{AgentPool, ClaimedAgent};
use crate::schedule::{BuildTarget, RemoteTarget};
use cadence_core::build::{
    Artifact, BuildContext, BuildFailure, BuildProperties, BuildRequest, FailureKind,
    ResultDocument,
};
use cadence_core::ids::BuildId;
use cadence_core::ports::Builder;
use cadence_core::{Error, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One build to run.
#[derive(Debug)]
pub struct DispatchRequest<'a> {
    pub build_id: BuildId,
    pub project: &'a str,
    pub target: &'a BuildTarget,
    pub properties: &'a BuildProperties,
    pub working_dir: Option<PathBuf>,
}

/// The normalized result plus the artifact files written locally.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: ResultDocument,
    pub artifacts: Vec<PathBuf>,
}

impl DispatchOutcome {
    fn failed(err: &Error) -> Self {
        Self {
            result: ResultDocument::from_error(err),
            artifacts: Vec::new(),
        }
    }
}

pub struct BuildDispatcher {
    pool: Option<Arc<AgentPool>>,
    artifact_dir: PathBuf,
}

impl BuildDispatcher {
    pub fn new(pool: Option<Arc<AgentPool>>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            artifact_dir: artifact_dir.into(),
        }
    }

    /// A dispatcher that can only run local builds.
    pub fn local(artifact_dir: impl Into<PathBuf>) -> Self {
        Self::new(None, artifact_dir)
    }

    pub fn pool(&self) -> Option<&Arc<AgentPool>> {
        self.pool.as_ref()
    }

    /// Directory artifacts of one build land in.
    pub fn artifact_dir_for(&self, project: &str, build_id: &BuildId) -> PathBuf {
        self.artifact_dir.join(project).join(build_id.to_string())
    }

    /// Run the build. Never fails: every error becomes a failed result.
    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> DispatchOutcome {
        let started = Instant::now();
        let dest = self.artifact_dir_for(request.project, &request.build_id);
        let mut outcome = match request.target {
            BuildTarget::Local(builder) => self.run_local(builder, &request, &dest).await,
            BuildTarget::Remote(remote) => self.run_remote(remote, &request, &dest).await,
        };
        if outcome.result.duration_ms == 0 {
            outcome.result.duration_ms = started.elapsed().as_millis() as u64;
        }
        info!(
            project = %request.project,
            build_id = %request.build_id,
            target = %request.target.describe(),
            success = outcome.result.success,
            artifacts = outcome.artifacts.len(),
            "Build dispatched"
        );
        outcome
    }

    async fn run_local(
        &self,
        builder: &Arc<dyn Builder>,
        request: &DispatchRequest<'_>,
        dest: &Path,
    ) -> DispatchOutcome {
        let ctx = BuildContext {
            working_dir: request.working_dir.clone(),
            output_dir: Some(dest.to_path_buf()),
        };
        match builder.build(request.properties, &ctx).await {
            Ok(result) => DispatchOutcome {
                result,
                artifacts: list_files(dest).await,
            },
            Err(e) => {
                warn!(project = %request.project, error = %e, "Local build failed");
                DispatchOutcome::failed(&e)
            }
        }
    }

    async fn run_remote(
        &self,
        remote: &RemoteTarget,
        request: &DispatchRequest<'_>,
        dest: &Path,
    ) -> DispatchOutcome {
        let Some(pool) = &self.pool else {
            return DispatchOutcome::failed(&Error::NoCapacity(
                "remote build requested but no agent pool is configured".into(),
            ));
        };

        let agent = match pool.pick_agent(&remote.filter).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(project = %request.project, error = %e, "No agent available");
                let err = if e.is_no_capacity() {
                    e
                } else {
                    Error::NoCapacity(e.to_string())
                };
                return DispatchOutcome::failed(&err);
            }
        };

        let build = BuildRequest {
            build_id: request.build_id,
            project: request.project.to_string(),
            module: remote.module.clone(),
            builder: remote.builder.clone(),
            properties: request.properties.clone(),
        };
        let outcome = run_on_agent(&agent, build, dest).await;

        let name = agent.advertisement().name.clone();
        if let Err(e) = agent.release().await {
            error!(agent = %name, error = %e, "Failed to release agent");
        }
        outcome
    }
}

async fn run_on_agent(agent: &ClaimedAgent, request: BuildRequest, dest: &Path) -> DispatchOutcome {
    let name = agent.advertisement().name.clone();
    debug!(agent = %name, build_id = %request.build_id, "Sending build to agent");

    let mut result = match agent.build(request).await {
        Ok(result) => result,
        Err(e) => {
            warn!(agent = %name, error = %e, "Remote build failed");
            let mut outcome = DispatchOutcome::failed(&e);
            outcome.result.agent = Some(name);
            return outcome;
        }
    };
    result.agent = Some(name.clone());

    let transferred = match agent.artifacts().await {
        Ok(artifacts) => write_artifacts(dest, artifacts).await,
        Err(e) => Err(Error::ArtifactTransfer(e.to_string())),
    };

    match transferred {
        Ok(artifacts) => DispatchOutcome { result, artifacts },
        Err(e) => {
            warn!(agent = %name, error = %e, "Artifact transfer failed");
            result.success = false;
            result.failure = Some(BuildFailure {
                kind: FailureKind::ArtifactTransfer,
                message: e.to_string(),
            });
            DispatchOutcome {
                result,
                artifacts: Vec::new(),
            }
        }
    }
}

/// Keep only plain path components so an artifact cannot escape `dest`.
fn safe_relative(name: &str) -> Option<PathBuf> {
    let path: PathBuf = Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    (!path.as_os_str().is_empty()).then_some(path)
}

async fn write_artifacts(dest: &Path, artifacts: Vec<Artifact>) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let relative = safe_relative(&artifact.name).ok_or_else(|| {
            Error::ArtifactTransfer(format!("invalid artifact name '{}'", artifact.name))
        })?;
        let path = dest.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::ArtifactTransfer(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, &artifact.bytes)
            .await
            .map_err(|e| Error::ArtifactTransfer(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), bytes = artifact.bytes.len(), "Artifact written");
        written.push(path);
    }
    Ok(written)
}

async fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(t) if t.is_dir() => pending.push(entry.path()),
                Ok(_) => files.push(entry.path()),
                Err(_) => {}
            }
        }
    }
    files.sort();
    files
}
