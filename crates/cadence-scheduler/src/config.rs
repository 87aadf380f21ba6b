//! Server and project configuration.

use crate::dispatcher::BuildDispatcher;
use crate::modifications::{DEFAULT_MAX_QUIET_WAIT, DEFAULT_QUIET_PERIOD, ModificationDetector};
use crate::pool::SelectionPolicy;
use crate::project::ProjectSetup;
use crate::schedule::{
    BuildTarget, PauseWindow, RemoteTarget, Schedule, ScheduledBuild, TimeOfDay, Trigger,
    parse_weekday,
};
use cadence_core::agent::AgentFilter;
use cadence_core::plugin::PluginSpec;
use cadence_core::{Error, Result};
use cadence_plugins::PluginRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration of a build server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Number of build queue workers.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Where project snapshots are kept between restarts.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Identity used when claiming agents. Derived from the host name if unset.
    #[serde(default)]
    pub master_id: Option<String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Listeners attached to every project.
    #[serde(default)]
    pub listeners: Vec<PluginSpec>,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

fn default_threads() -> usize {
    1
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            state_dir: None,
            log_dir: default_log_dir(),
            artifact_dir: default_artifact_dir(),
            master_id: None,
            discovery: DiscoveryConfig::default(),
            selection: SelectionConfig::default(),
            listeners: Vec::new(),
            projects: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Reject duplicate project names.
    pub fn check_unique_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.name.as_str()) {
                return Err(Error::DuplicateProject(project.name.clone()));
            }
        }
        Ok(())
    }

    /// Everything that can be checked without starting anything.
    pub fn validate(&self, registry: &PluginRegistry) -> Result<()> {
        self.check_unique_names()?;
        for spec in &self.listeners {
            registry.create_listener(spec)?;
        }
        let dispatcher = Arc::new(BuildDispatcher::local(&self.artifact_dir));
        for project in &self.projects {
            project.to_setup(registry, Arc::clone(&dispatcher), self)?;
        }
        Ok(())
    }

    pub fn project_log_dir(&self, project: &str) -> PathBuf {
        self.log_dir.join(project)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Registrar locations, e.g. NATS server URLs.
    #[serde(default)]
    pub locators: Vec<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// How long a lookup collects agent replies.
    #[serde(default = "default_lookup_window")]
    pub lookup_window_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_lookup_window() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    10
}

fn default_build_timeout() -> u64 {
    3600
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            locators: Vec::new(),
            refresh_interval_secs: default_refresh_interval(),
            lookup_window_ms: default_lookup_window(),
            request_timeout_secs: default_request_timeout(),
            build_timeout_secs: default_build_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionConfig {
    #[default]
    FailFast,
    Blocking {
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
        #[serde(default = "default_selection_timeout")]
        timeout_secs: u64,
    },
}

fn default_poll_interval() -> u64 {
    5
}

fn default_selection_timeout() -> u64 {
    300
}

impl SelectionConfig {
    pub fn policy(&self) -> SelectionPolicy {
        match *self {
            SelectionConfig::FailFast => SelectionPolicy::FailFast,
            SelectionConfig::Blocking {
                poll_interval_secs,
                timeout_secs,
            } => SelectionPolicy::Blocking {
                poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
                timeout: Duration::from_secs(timeout_secs),
            },
        }
    }
}

/// One project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// Initial label. Defaults to the incrementer's default label.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_label_incrementer")]
    pub label_incrementer: PluginSpec,
    #[serde(default = "default_true")]
    pub build_after_failed: bool,
    #[serde(default = "default_true")]
    pub require_modification: bool,
    #[serde(default)]
    pub force_only: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub modifications: Option<ModificationsConfig>,
    #[serde(default)]
    pub bootstrappers: Vec<PluginSpec>,
    #[serde(default)]
    pub publishers: Vec<PluginSpec>,
    #[serde(default)]
    pub listeners: Vec<PluginSpec>,
}

fn default_true() -> bool {
    true
}

fn default_label_incrementer() -> PluginSpec {
    PluginSpec::new("default")
}

impl ProjectConfig {
    /// The label a fresh project starts with, validated by its incrementer.
    pub fn initial_label(&self, registry: &PluginRegistry) -> Result<String> {
        let incrementer = registry.create_label_incrementer(&self.label_incrementer)?;
        let label = self
            .label
            .clone()
            .unwrap_or_else(|| incrementer.default_label());
        if !incrementer.is_valid_label(&label) {
            return Err(Error::InvalidLabel(format!(
                "'{}' for project {}",
                label, self.name
            )));
        }
        Ok(label)
    }

    /// Instantiate every plugin and assemble the live setup. Server-wide
    /// listeners are not included.
    pub fn to_setup(
        &self,
        registry: &PluginRegistry,
        dispatcher: Arc<BuildDispatcher>,
        server: &ServerConfig,
    ) -> Result<ProjectSetup> {
        self.initial_label(registry)?;

        let mut setup = ProjectSetup::new(dispatcher, server.project_log_dir(&self.name))
            .with_schedule(self.schedule.to_schedule(registry)?)
            .with_label_incrementer(registry.create_label_incrementer(&self.label_incrementer)?)
            .build_after_failed(self.build_after_failed)
            .require_modification(self.require_modification)
            .force_only(self.force_only);

        if let Some(modifications) = &self.modifications {
            setup = setup.with_detector(modifications.to_detector(registry)?);
        }
        for spec in &self.bootstrappers {
            setup = setup.with_bootstrapper(registry.create_bootstrapper(spec)?);
        }
        for spec in &self.publishers {
            setup = setup.with_publisher(registry.create_publisher(spec)?);
        }
        for spec in &self.listeners {
            setup = setup.with_listener(registry.create_listener(spec)?);
        }
        if let Some(dir) = &server.state_dir {
            setup = setup.with_state_dir(dir);
        }
        if let Some(dir) = &self.working_dir {
            setup = setup.with_working_dir(dir);
        }
        Ok(setup)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub builds: Vec<BuildConfig>,
    #[serde(default)]
    pub pauses: Vec<PauseConfig>,
}

fn default_interval() -> u64 {
    crate::schedule::DEFAULT_INTERVAL_SECS as u64
}

impl ScheduleConfig {
    pub fn to_schedule(&self, registry: &PluginRegistry) -> Result<Schedule> {
        if self.builds.is_empty() {
            return Err(Error::Configuration(
                "schedule must contain at least one build".into(),
            ));
        }
        if self.interval_secs == 0 {
            return Err(Error::Configuration(
                "schedule interval_secs must be at least 1".into(),
            ));
        }
        let interval = i64::try_from(self.interval_secs)
            .map_err(|_| Error::Configuration(format!("interval {} too large", self.interval_secs)))?;
        let mut schedule = Schedule::new(chrono::Duration::seconds(interval));
        for build in &self.builds {
            schedule = schedule.with_build(build.to_scheduled(registry)?);
        }
        for pause in &self.pauses {
            schedule = schedule.with_pause(pause.to_window()?);
        }
        Ok(schedule)
    }
}

/// A build entry: `builder` plus at most one of `time`/`multiple`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub builder: PluginSpec,
    /// `HHmm`.
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub day: Option<String>,
    #[serde(default)]
    pub multiple: Option<u32>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    #[serde(default)]
    pub module: Option<String>,
}

impl BuildConfig {
    pub fn to_scheduled(&self, registry: &PluginRegistry) -> Result<ScheduledBuild> {
        let trigger = match (&self.time, self.multiple) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "a build may set 'time' or 'multiple', not both".into(),
                ));
            }
            (Some(time), None) => Trigger::Time(TimeOfDay::parse(time)?),
            (None, Some(0)) => {
                return Err(Error::Configuration("'multiple' must be at least 1".into()));
            }
            (None, Some(n)) => Trigger::Multiple(n),
            (None, None) => Trigger::Multiple(1),
        };

        let target = match &self.remote {
            Some(remote) => {
                let mut filter = AgentFilter::any();
                for (key, value) in &remote.filter {
                    filter = filter.with(key.clone(), value.clone());
                }
                BuildTarget::Remote(RemoteTarget {
                    builder: self.builder.clone(),
                    filter,
                    module: remote.module.clone(),
                })
            }
            None => BuildTarget::Local(registry.create_builder(&self.builder)?),
        };

        Ok(ScheduledBuild {
            trigger,
            day: self.day.as_deref().map(parse_weekday).transpose()?,
            target,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseConfig {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub day: Option<String>,
}

impl PauseConfig {
    pub fn to_window(&self) -> Result<PauseWindow> {
        let mut window = PauseWindow::new(TimeOfDay::parse(&self.start)?, TimeOfDay::parse(&self.end)?);
        window.day = self.day.as_deref().map(parse_weekday).transpose()?;
        Ok(window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationsConfig {
    #[serde(default = "default_quiet_period")]
    pub quiet_period_secs: u64,
    #[serde(default = "default_max_quiet_wait")]
    pub max_quiet_wait_secs: u64,
    pub sources: Vec<PluginSpec>,
}

fn default_quiet_period() -> u64 {
    DEFAULT_QUIET_PERIOD.as_secs()
}

fn default_max_quiet_wait() -> u64 {
    DEFAULT_MAX_QUIET_WAIT.as_secs()
}

impl ModificationsConfig {
    pub fn to_detector(&self, registry: &PluginRegistry) -> Result<ModificationDetector> {
        let sources = self
            .sources
            .iter()
            .map(|spec| registry.create_source(spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(ModificationDetector::new(sources)
            .with_quiet_period(Duration::from_secs(self.quiet_period_secs))
            .with_max_quiet_wait(Duration::from_secs(self.max_quiet_wait_secs)))
    }
}
