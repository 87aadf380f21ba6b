//! Agent side of the claim protocol and remote build execution.

use crate::config::AgentConfig;
use async_trait::async_trait;
use cadence_core::agent::{Advertisement, AgentPhase, Attributes, ClaimLease};
use cadence_core::build::{Artifact, BuildContext, BuildRequest, ResultDocument};
use cadence_core::ids::{AgentId, MasterId};
use cadence_core::ports::AgentService;
use cadence_core::{Error, Result};
use cadence_plugins::PluginRegistry;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Slot {
    phase: AgentPhase,
    lease: Option<ClaimLease>,
    outputs: Vec<Artifact>,
    workspace: Option<PathBuf>,
    /// The holder let go while a build was running.
    release_on_finish: bool,
}

impl Slot {
    fn check_holder(&self, agent: &str, master: &MasterId) -> Result<()> {
        match &self.lease {
            Some(lease) if &lease.holder == master => Ok(()),
            Some(lease) => Err(Error::AgentNotClaimed(format!(
                "{} is held by {}, not {}",
                agent, lease.holder, master
            ))),
            None => Err(Error::AgentNotClaimed(format!("{} is not claimed", agent))),
        }
    }
}

/// A build agent. All claim state lives behind one lock so the busy check
/// and the claim are a single step.
pub struct BuildAgentService {
    agent_id: AgentId,
    name: String,
    attributes: Attributes,
    registry: PluginRegistry,
    workspace_dir: PathBuf,
    slot: Mutex<Slot>,
    phase_tx: watch::Sender<AgentPhase>,
}

impl BuildAgentService {
    pub fn new(
        name: impl Into<String>,
        attributes: Attributes,
        registry: PluginRegistry,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(AgentPhase::Available);
        Self {
            agent_id: AgentId::new(),
            name: name.into(),
            attributes,
            registry,
            workspace_dir: workspace_dir.into(),
            slot: Mutex::new(Slot {
                phase: AgentPhase::Available,
                lease: None,
                outputs: Vec::new(),
                workspace: None,
                release_on_finish: false,
            }),
            phase_tx,
        }
    }

    pub fn from_config(config: &AgentConfig, registry: PluginRegistry) -> Self {
        Self::new(
            config.name.clone(),
            config.effective_attributes(),
            registry,
            config.workspace_dir.clone(),
        )
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> AgentPhase {
        self.slot().phase
    }

    pub fn watch_phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase_tx.subscribe()
    }

    pub fn advertisement(&self) -> Advertisement {
        let mut ad = Advertisement::new(self.agent_id, self.name.clone(), self.attributes.clone());
        ad.busy = self.phase().is_busy();
        ad
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, slot: &mut Slot, phase: AgentPhase) {
        slot.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// Back to available. Returns the workspace to delete.
    fn release(&self, slot: &mut Slot) -> Option<PathBuf> {
        slot.lease = None;
        slot.outputs.clear();
        slot.release_on_finish = false;
        self.set_phase(slot, AgentPhase::Available);
        slot.workspace.take()
    }

    async fn remove_workspace(&self, workspace: Option<PathBuf>) {
        if let Some(dir) = workspace {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                debug!(path = %dir.display(), error = %e, "Workspace not removed");
            }
        }
        info!(agent = %self.name, "Agent released");
    }

    async fn run_build(&self, request: &BuildRequest, workspace: &Path) -> ResultDocument {
        let working_dir = workspace.join("work");
        let output_dir = workspace.join("output");
        for dir in [&working_dir, &output_dir] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return ResultDocument::from_error(&Error::Io(e));
            }
        }

        let builder = match self.registry.create_builder(&request.builder) {
            Ok(builder) => builder,
            Err(e) => return ResultDocument::from_error(&e),
        };

        let mut properties = request.properties.clone();
        if let Some(module) = &request.module {
            properties.insert("module".into(), module.clone());
        }
        let ctx = BuildContext {
            working_dir: Some(working_dir),
            output_dir: Some(output_dir),
        };
        match builder.build(&properties, &ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(agent = %self.name, build_id = %request.build_id, error = %e, "Build failed");
                ResultDocument::from_error(&e)
            }
        }
    }
}

#[async_trait]
impl AgentService for BuildAgentService {
    async fn claim(&self, master: &MasterId) -> Result<bool> {
        let mut slot = self.slot();
        if slot.phase.is_busy() {
            debug!(agent = %self.name, master = %master, "Claim refused, agent busy");
            return Ok(false);
        }
        slot.lease = Some(ClaimLease {
            agent_id: self.agent_id,
            holder: master.clone(),
            acquired_at: chrono::Utc::now(),
        });
        self.set_phase(&mut slot, AgentPhase::Claimed);
        info!(agent = %self.name, master = %master, "Agent claimed");
        Ok(true)
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(self.phase().is_busy())
    }

    async fn lease(&self) -> Result<Option<ClaimLease>> {
        Ok(self.slot().lease.clone())
    }

    async fn do_build(&self, master: &MasterId, request: BuildRequest) -> Result<ResultDocument> {
        let workspace = self.workspace_dir.join(request.build_id.to_string());
        {
            let mut slot = self.slot();
            slot.check_holder(&self.name, master)?;
            if slot.phase != AgentPhase::Claimed {
                return Err(Error::AgentNotClaimed(format!(
                    "{} is {:?}, a build needs a fresh claim",
                    self.name, slot.phase
                )));
            }
            slot.workspace = Some(workspace.clone());
            self.set_phase(&mut slot, AgentPhase::Building);
        }

        info!(
            agent = %self.name,
            build_id = %request.build_id,
            project = %request.project,
            builder = %request.builder.tag,
            "Starting remote build"
        );
        let started = Instant::now();
        let mut result = self.run_build(&request, &workspace).await;
        if result.duration_ms == 0 {
            result.duration_ms = started.elapsed().as_millis() as u64;
        }
        result.agent = Some(self.name.clone());

        let outputs = match collect_outputs(&workspace.join("output")).await {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Failed to collect outputs");
                Vec::new()
            }
        };
        info!(
            agent = %self.name,
            build_id = %request.build_id,
            success = result.success,
            outputs = outputs.len(),
            "Remote build finished"
        );

        let abandoned = {
            let mut slot = self.slot();
            if slot.release_on_finish {
                Some(self.release(&mut slot))
            } else {
                slot.outputs = outputs;
                self.set_phase(&mut slot, AgentPhase::OutputsPending);
                None
            }
        };
        if let Some(workspace) = abandoned {
            debug!(agent = %self.name, build_id = %request.build_id, "Outputs discarded, holder already released");
            self.remove_workspace(workspace).await;
        }
        Ok(result)
    }

    async fn retrieve_artifacts(&self, master: &MasterId) -> Result<Vec<Artifact>> {
        let slot = self.slot();
        slot.check_holder(&self.name, master)?;
        match slot.phase {
            AgentPhase::OutputsPending => Ok(slot.outputs.clone()),
            AgentPhase::Claimed => Ok(Vec::new()),
            phase => Err(Error::AgentNotClaimed(format!(
                "{} has no outputs while {:?}",
                self.name, phase
            ))),
        }
    }

    async fn clear_outputs(&self, master: &MasterId) -> Result<()> {
        let workspace = {
            let mut slot = self.slot();
            slot.check_holder(&self.name, master)?;
            if slot.phase == AgentPhase::Building {
                slot.release_on_finish = true;
                info!(agent = %self.name, master = %master, "Release deferred until build finishes");
                return Ok(());
            }
            self.release(&mut slot)
        };
        self.remove_workspace(workspace).await;
        Ok(())
    }
}

/// Every file under `dir`, named by its path relative to `dir`.
async fn collect_outputs(dir: &Path) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    if !tokio::fs::try_exists(dir).await? {
        return Ok(artifacts);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let name = path
                .strip_prefix(dir)
                .map_err(|e| Error::Internal(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = tokio::fs::read(&path).await?;
            artifacts.push(Artifact { name, bytes });
        }
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::build::{BuildProperties, FailureKind};
    use cadence_core::ids::BuildId;
    use cadence_core::plugin::PluginSpec;
    use std::sync::Arc;

    fn agent(dir: &Path) -> BuildAgentService {
        BuildAgentService::new("agent-1", Attributes::new(), PluginRegistry::builtin(), dir)
    }

    fn request(command: &str) -> BuildRequest {
        BuildRequest {
            build_id: BuildId::new(),
            project: "proj".into(),
            module: Some("core".into()),
            builder: PluginSpec::new("exec").with_param("command", command),
            properties: BuildProperties::new(),
        }
    }

    #[tokio::test]
    async fn test_only_one_claim_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(agent(dir.path()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let agent = Arc::clone(&agent);
            tasks.push(tokio::spawn(async move {
                agent.claim(&MasterId::new(format!("m{i}"))).await.unwrap()
            }));
        }
        let mut won = 0;
        for task in tasks {
            if task.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
        assert!(agent.is_busy().await.unwrap());
        assert!(agent.lease().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_build_without_claim_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path());
        let err = agent
            .do_build(&MasterId::new("m"), request("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotClaimed(_)));
    }

    #[tokio::test]
    async fn test_stays_busy_until_outputs_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path());
        let master = MasterId::new("m");
        assert!(agent.claim(&master).await.unwrap());

        let result = agent
            .do_build(&master, request(
                "mkdir -p \"$CADENCE_OUTPUT_DIR/reports\" && echo \"$CADENCE_MODULE\" > \"$CADENCE_OUTPUT_DIR/reports/module.txt\"",
            ))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.agent.as_deref(), Some("agent-1"));
        assert_eq!(agent.phase(), AgentPhase::OutputsPending);
        assert!(!agent.claim(&MasterId::new("other")).await.unwrap());

        let artifacts = agent.retrieve_artifacts(&master).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "reports/module.txt");
        assert_eq!(artifacts[0].bytes, b"core\n");

        agent.clear_outputs(&master).await.unwrap();
        assert_eq!(agent.phase(), AgentPhase::Available);
        assert!(agent.lease().await.unwrap().is_none());
        assert!(agent.claim(&MasterId::new("other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_build_still_holds_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path());
        let master = MasterId::new("m");
        agent.claim(&master).await.unwrap();

        let result = agent.do_build(&master, request("exit 3")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::BuildFailed));
        assert!(agent.is_busy().await.unwrap());
        assert!(agent.advertisement().busy);
    }

    #[tokio::test]
    async fn test_unknown_builder_is_a_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path());
        let master = MasterId::new("m");
        agent.claim(&master).await.unwrap();

        let mut req = request("true");
        req.builder = PluginSpec::new("maven");
        let result = agent.do_build(&master, req).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::Internal));
    }

    #[tokio::test]
    async fn test_clear_without_build_releases() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path());
        let master = MasterId::new("m");
        agent.claim(&master).await.unwrap();
        assert!(agent.retrieve_artifacts(&master).await.unwrap().is_empty());
        agent.clear_outputs(&master).await.unwrap();
        assert!(!agent.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn test_only_the_holder_drives_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path());
        let holder = MasterId::new("a");
        let intruder = MasterId::new("b");
        assert!(agent.claim(&holder).await.unwrap());

        let err = agent.clear_outputs(&intruder).await.unwrap_err();
        assert!(matches!(err, Error::AgentNotClaimed(_)));
        assert!(!agent.claim(&intruder).await.unwrap());

        let err = agent.do_build(&intruder, request("true")).await.unwrap_err();
        assert!(matches!(err, Error::AgentNotClaimed(_)));
        let err = agent.retrieve_artifacts(&intruder).await.unwrap_err();
        assert!(matches!(err, Error::AgentNotClaimed(_)));
        assert_eq!(agent.phase(), AgentPhase::Claimed);
        assert_eq!(agent.lease().await.unwrap().unwrap().holder, holder);

        agent.clear_outputs(&holder).await.unwrap();
        let err = agent.clear_outputs(&holder).await.unwrap_err();
        assert!(matches!(err, Error::AgentNotClaimed(_)));
    }

    #[tokio::test]
    async fn test_release_during_build_frees_agent_when_build_ends() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(agent(dir.path()));
        let master = MasterId::new("a");
        assert!(agent.claim(&master).await.unwrap());

        let build = {
            let agent = Arc::clone(&agent);
            let master = master.clone();
            tokio::spawn(async move {
                agent
                    .do_build(&master, request("sleep 0.3 && touch \"$CADENCE_OUTPUT_DIR/late.txt\""))
                    .await
            })
        };
        agent
            .watch_phase()
            .wait_for(|p| *p == AgentPhase::Building)
            .await
            .unwrap();

        agent.clear_outputs(&master).await.unwrap();
        assert_eq!(agent.phase(), AgentPhase::Building);
        assert!(!agent.claim(&MasterId::new("b")).await.unwrap());

        let result = build.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(agent.phase(), AgentPhase::Available);
        assert!(agent.lease().await.unwrap().is_none());
        assert!(agent.claim(&MasterId::new("b")).await.unwrap());
        assert!(agent.retrieve_artifacts(&MasterId::new("b")).await.unwrap().is_empty());
    }
}
