//! Owns the build queue, the agent pool and every configured project.

use crate::config::{ProjectConfig, ServerConfig};
use crate::dispatcher::BuildDispatcher;
use crate::events::EventHub;
use crate::pool::{AgentPool, Discovery};
use crate::project::Project;
use crate::queue::BuildQueue;
use crate::snapshot::ProjectSnapshot;
use cadence_core::events::ProjectEvent;
use cadence_core::ids::MasterId;
use cadence_core::ports::{Listener, RegistrarLocator};
use cadence_core::{Error, Result};
use cadence_plugins::PluginRegistry;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 1024;

pub struct Controller {
    server: ServerConfig,
    registry: PluginRegistry,
    queue: BuildQueue,
    pool: Option<Arc<AgentPool>>,
    dispatcher: Arc<BuildDispatcher>,
    projects: RwLock<BTreeMap<String, Project>>,
    events: broadcast::Sender<ProjectEvent>,
    global: EventHub,
    global_listeners: Vec<Arc<dyn Listener>>,
    shutdown_tx: watch::Sender<bool>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Build a controller. With no locators, remote builds fail for lack of
    /// capacity and local builds run as usual.
    pub fn new(
        server: ServerConfig,
        registry: PluginRegistry,
        locators: Vec<Arc<dyn RegistrarLocator>>,
    ) -> Result<Self> {
        server.check_unique_names()?;

        let master = match &server.master_id {
            Some(id) => MasterId::new(id.clone()),
            None => MasterId::generate(&local_host()),
        };
        let pool = if locators.is_empty() {
            None
        } else {
            let discovery = Arc::new(Discovery::new(locators));
            Some(Arc::new(AgentPool::new(
                discovery,
                master.clone(),
                server.selection.policy(),
            )))
        };
        let dispatcher = Arc::new(BuildDispatcher::new(pool.clone(), &server.artifact_dir));

        let global_listeners = server
            .listeners
            .iter()
            .map(|spec| registry.create_listener(spec))
            .collect::<Result<Vec<_>>>()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let global = EventHub::with_sender(events.clone());
        global.set_listeners(global_listeners.clone());

        let (shutdown_tx, _) = watch::channel(false);
        info!(master = %master, remote = pool.is_some(), "Controller created");
        Ok(Self {
            server,
            registry,
            queue: BuildQueue::new(),
            pool,
            dispatcher,
            projects: RwLock::new(BTreeMap::new()),
            events,
            global,
            global_listeners,
            shutdown_tx,
            refresh: Mutex::new(None),
        })
    }

    /// Start queue workers and discovery, then load the configured projects.
    pub async fn start(&self) -> Result<()> {
        self.queue.start(self.server.threads);
        if let Some(pool) = &self.pool {
            let every = Duration::from_secs(self.server.discovery.refresh_interval_secs.max(1));
            let handle = Arc::clone(pool.discovery())
                .spawn_refresh(every, self.shutdown_tx.subscribe());
            *self
                .refresh
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        }
        let projects = self.server.projects.clone();
        self.reload(projects).await
    }

    /// Bring the running project set in line with `projects`: new names are
    /// added and started, missing names stopped and removed, and existing
    /// projects get the new configuration attached.
    pub async fn reload(&self, projects: Vec<ProjectConfig>) -> Result<()> {
        let mut names = HashSet::new();
        for project in &projects {
            if !names.insert(project.name.clone()) {
                return Err(Error::DuplicateProject(project.name.clone()));
            }
        }

        // Build every setup first so a bad entry leaves the running set untouched.
        let mut setups = Vec::with_capacity(projects.len());
        for config in &projects {
            let mut setup =
                config.to_setup(&self.registry, Arc::clone(&self.dispatcher), &self.server)?;
            setup.listeners.extend(self.global_listeners.iter().cloned());
            setups.push((config, setup));
        }

        let mut current = self.projects.write().await;

        let removed: Vec<String> = current
            .keys()
            .filter(|name| !names.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(project) = current.remove(&name) {
                project.stop().await;
                self.save_snapshot(&project).await;
                self.global.project_removed(&name).await;
                info!(project = %name, "Project removed");
            }
        }

        for (config, setup) in setups {
            if let Some(project) = current.get(&config.name) {
                project.attach(setup);
                project.init()?;
                info!(project = %config.name, "Project configuration updated");
                continue;
            }

            let project = self.create_project(config).await?;
            project.attach(setup);
            project.init()?;
            project.start(self.queue.clone()).await?;
            current.insert(config.name.clone(), project);
            self.global.project_added(&config.name).await;
            info!(project = %config.name, "Project added");
        }
        Ok(())
    }

    async fn create_project(&self, config: &ProjectConfig) -> Result<Project> {
        let hub = EventHub::with_sender(self.events.clone());
        if let Some(dir) = &self.server.state_dir {
            match ProjectSnapshot::load_named(dir, &config.name).await {
                Ok(Some(snapshot)) => {
                    info!(project = %config.name, label = %snapshot.label, "Restoring project from snapshot");
                    return Ok(Project::restore(snapshot, hub));
                }
                Ok(None) => {}
                Err(e) => warn!(project = %config.name, error = %e, "Ignoring unreadable snapshot"),
            }
        }
        let project = Project::new(config.name.clone(), hub);
        project.set_label(config.initial_label(&self.registry)?);
        Ok(project)
    }

    async fn save_snapshot(&self, project: &Project) {
        let Some(dir) = &self.server.state_dir else {
            return;
        };
        if let Err(e) = project.snapshot().save(dir).await {
            error!(project = %project.name(), error = %e, "Failed to save snapshot");
        }
    }

    pub async fn project(&self, name: &str) -> Result<Project> {
        self.projects
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))
    }

    pub async fn project_names(&self) -> Vec<String> {
        self.projects.read().await.keys().cloned().collect()
    }

    pub async fn force_build(&self, name: &str) -> Result<()> {
        self.project(name).await?.force_build();
        Ok(())
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.project(name).await?.set_paused(true);
        Ok(())
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.project(name).await?.set_paused(false);
        Ok(())
    }

    pub async fn project_snapshots(&self) -> Vec<ProjectSnapshot> {
        self.projects
            .read()
            .await
            .values()
            .map(Project::snapshot)
            .collect()
    }

    /// Every event from every project.
    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    pub fn pool(&self) -> Option<&Arc<AgentPool>> {
        self.pool.as_ref()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Stop every project and the queue, then persist snapshots.
    pub async fn shutdown(&self) {
        info!("Controller shutting down");
        self.shutdown_tx.send_replace(true);

        let projects: Vec<Project> = self.projects.read().await.values().cloned().collect();
        for project in &projects {
            project.stop().await;
        }
        self.queue.shutdown().await;
        for project in &projects {
            self.save_snapshot(project).await;
        }

        let refresh = self
            .refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = refresh {
            if let Err(e) = handle.await {
                warn!(error = %e, "Discovery refresh ended abnormally");
            }
        }
        info!(projects = projects.len(), "Controller stopped");
    }
}

fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cadence".to_string())
}
