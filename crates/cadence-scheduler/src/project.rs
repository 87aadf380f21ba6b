//! Per-project state machine and timing loop.
//!
//! A [`Project`] is a cheap handle. Its scheduling loop runs on its own task
//! and suspends in exactly three places: while paused, until the next build
//! time, and until a queued build has finished. Builds themselves run on a
//! [`BuildQueue`] worker through [`Buildable::execute`].

use crate::dispatcher::{BuildDispatcher, DispatchRequest};
use crate::events::EventHub;
use crate::modifications::{ModificationCheck, ModificationDetector};
use crate::queue::{BuildQueue, Buildable};
use crate::resultlog;
use crate::schedule::{Schedule, need_to_wait};
use crate::snapshot::{ProjectSnapshot, SNAPSHOT_VERSION};
use async_trait::async_trait;
use cadence_core::build::{BuildLog, BuildProperties};
use cadence_core::events::{BuildProgressPayload, BuildResultPayload, ProjectEvent, ProjectState};
use cadence_core::ids::BuildId;
use cadence_core::ports::{Bootstrapper, LabelIncrementer, Listener, Publisher};
use cadence_core::time;
use cadence_core::{Error, Result};
use cadence_plugins::DefaultLabelIncrementer;
use chrono::{Duration, NaiveDateTime, NaiveTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything a project needs to build, attached after construction.
pub struct ProjectSetup {
    pub build_after_failed: bool,
    pub require_modification: bool,
    /// Never build from the timer, only when forced.
    pub force_only: bool,
    pub schedule: Option<Schedule>,
    pub detector: Option<ModificationDetector>,
    pub bootstrappers: Vec<Arc<dyn Bootstrapper>>,
    pub publishers: Vec<Arc<dyn Publisher>>,
    pub label_incrementer: Arc<dyn LabelIncrementer>,
    pub listeners: Vec<Arc<dyn Listener>>,
    pub dispatcher: Arc<BuildDispatcher>,
    pub log_dir: PathBuf,
    pub state_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl ProjectSetup {
    pub fn new(dispatcher: Arc<BuildDispatcher>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_after_failed: true,
            require_modification: true,
            force_only: false,
            schedule: None,
            detector: None,
            bootstrappers: Vec::new(),
            publishers: Vec::new(),
            label_incrementer: Arc::new(DefaultLabelIncrementer::default()),
            listeners: Vec::new(),
            dispatcher,
            log_dir: log_dir.into(),
            state_dir: None,
            working_dir: None,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_detector(mut self, detector: ModificationDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_bootstrapper(mut self, bootstrapper: Arc<dyn Bootstrapper>) -> Self {
        self.bootstrappers.push(bootstrapper);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_label_incrementer(mut self, incrementer: Arc<dyn LabelIncrementer>) -> Self {
        self.label_incrementer = incrementer;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn build_after_failed(mut self, value: bool) -> Self {
        self.build_after_failed = value;
        self
    }

    pub fn require_modification(mut self, value: bool) -> Self {
        self.require_modification = value;
        self
    }

    pub fn force_only(mut self, value: bool) -> Self {
        self.force_only = value;
        self
    }
}

#[derive(Debug, Clone)]
struct Record {
    label: String,
    last_build: NaiveDateTime,
    last_successful_build: NaiveDateTime,
    last_build_successful: bool,
    build_counter: u64,
    build_start_time: Option<NaiveDateTime>,
    build_after_failed: bool,
}

impl Record {
    fn fresh() -> Self {
        let midnight = time::now().date().and_time(NaiveTime::MIN);
        Self {
            label: DefaultLabelIncrementer::default().default_label(),
            last_build: midnight,
            last_successful_build: midnight,
            last_build_successful: true,
            build_counter: 0,
            build_start_time: None,
            build_after_failed: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    paused: bool,
    forced: bool,
    stop_requested: bool,
}

struct Inner {
    name: String,
    record: Mutex<Record>,
    setup: RwLock<Option<Arc<ProjectSetup>>>,
    control: watch::Sender<Control>,
    state: watch::Sender<ProjectState>,
    in_flight: watch::Sender<bool>,
    build_lock: tokio::sync::Mutex<()>,
    events: EventHub,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A continuously built project. Cloning yields another handle to the same
/// project.
#[derive(Clone)]
pub struct Project {
    inner: Arc<Inner>,
}

impl Project {
    pub fn new(name: impl Into<String>, events: EventHub) -> Self {
        Self::from_parts(name.into(), Record::fresh(), Control::default(), events)
    }

    /// Rebuild a project from a snapshot. Configuration must be attached
    /// again before it can start.
    pub fn restore(snapshot: ProjectSnapshot, events: EventHub) -> Self {
        let record = Record {
            label: snapshot.label,
            last_build: snapshot.last_build,
            last_successful_build: snapshot.last_successful_build,
            last_build_successful: snapshot.last_build_successful,
            build_counter: snapshot.build_counter,
            build_start_time: None,
            build_after_failed: true,
        };
        let control = Control {
            paused: snapshot.paused,
            forced: snapshot.build_forced,
            stop_requested: false,
        };
        Self::from_parts(snapshot.name, record, control, events)
    }

    fn from_parts(name: String, record: Record, control: Control, events: EventHub) -> Self {
        let (control, _) = watch::channel(control);
        let (state, _) = watch::channel(ProjectState::Stopped);
        let (in_flight, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name,
                record: Mutex::new(record),
                setup: RwLock::new(None),
                control,
                state,
                in_flight,
                build_lock: tokio::sync::Mutex::new(()),
                events,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn control(&self) -> Control {
        *self.inner.control.borrow()
    }

    // -- configuration ------------------------------------------------------

    /// Attach live configuration. Replaces any previous setup.
    pub fn attach(&self, setup: ProjectSetup) {
        self.record().build_after_failed = setup.build_after_failed;
        let setup = Arc::new(setup);
        match self.inner.setup.write() {
            Ok(mut current) => *current = Some(setup),
            Err(poisoned) => *poisoned.into_inner() = Some(setup),
        }
    }

    pub fn setup(&self) -> Option<Arc<ProjectSetup>> {
        match self.inner.setup.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn setup_for(&self, operation: &str) -> Result<Arc<ProjectSetup>> {
        self.setup().ok_or_else(|| {
            Error::IllegalState(format!(
                "projectConfig must be set on project before calling {}",
                operation
            ))
        })
    }

    /// Validate the attached configuration and install listeners.
    pub fn init(&self) -> Result<()> {
        let setup = self.setup_for("init()")?;
        if let Some(schedule) = &setup.schedule {
            if schedule.interval <= Duration::zero() {
                return Err(Error::Configuration(format!(
                    "schedule interval for project {} must be positive",
                    self.inner.name
                )));
            }
        }
        let label = self.label();
        if !setup.label_incrementer.is_valid_label(&label) {
            return Err(Error::InvalidLabel(format!(
                "'{}' for project {}",
                label, self.inner.name
            )));
        }
        self.inner.events.set_listeners(setup.listeners.clone());
        info!(project = %self.inner.name, label = %label, "Project initialized");
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spawn the scheduling loop, feeding builds into `queue`.
    pub async fn start(&self, queue: BuildQueue) -> Result<()> {
        let setup = self.setup_for("start()")?;
        if setup.schedule.is_none() {
            return Err(Error::IllegalState("project must have a schedule".into()));
        }
        if self.is_running() {
            warn!(project = %self.inner.name, "Project already started");
            return Ok(());
        }

        self.inner.control.send_modify(|c| c.stop_requested = false);
        self.set_state(ProjectState::Idle).await;
        let handle = tokio::spawn(self.clone().run(queue));
        *self.task() = Some(handle);
        info!(project = %self.inner.name, "Project started");
        Ok(())
    }

    /// Stop the scheduling loop. A build already handed to the queue is not
    /// interrupted and moves the project to `Stopped` when it finishes.
    pub async fn stop(&self) {
        self.inner.control.send_modify(|c| c.stop_requested = true);
        let handle = self.task().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(project = %self.inner.name, error = %e, "Scheduler task ended abnormally");
            }
        }
        let state = self.state();
        if !state.is_building() && state != ProjectState::Queued {
            self.set_state(ProjectState::Stopped).await;
        }
        info!(project = %self.inner.name, "Project stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn force_build(&self) {
        self.inner.control.send_modify(|c| c.forced = true);
        info!(project = %self.inner.name, "Build forced");
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.control.send_modify(|c| c.paused = paused);
        info!(project = %self.inner.name, paused, "Pause state changed");
    }

    pub fn is_paused(&self) -> bool {
        self.control().paused
    }

    pub fn is_forced(&self) -> bool {
        self.control().forced
    }

    fn take_forced(&self) -> bool {
        let mut forced = false;
        self.inner.control.send_if_modified(|c| {
            forced = c.forced;
            c.forced = false;
            forced
        });
        forced
    }

    // -- observation --------------------------------------------------------

    pub fn state(&self) -> ProjectState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProjectState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        let control = self.control();
        let record = self.record();
        ProjectSnapshot {
            version: SNAPSHOT_VERSION,
            name: self.inner.name.clone(),
            label: record.label.clone(),
            last_build: record.last_build,
            last_successful_build: record.last_successful_build,
            last_build_successful: record.last_build_successful,
            build_counter: record.build_counter,
            paused: control.paused,
            build_forced: control.forced,
        }
    }

    pub fn label(&self) -> String {
        self.record().label.clone()
    }

    pub fn last_build(&self) -> NaiveDateTime {
        self.record().last_build
    }

    pub fn last_successful_build(&self) -> NaiveDateTime {
        self.record().last_successful_build
    }

    pub fn is_last_build_successful(&self) -> bool {
        self.record().last_build_successful
    }

    pub fn build_counter(&self) -> u64 {
        self.record().build_counter
    }

    pub fn build_start_time(&self) -> Option<NaiveDateTime> {
        self.record().build_start_time
    }

    pub fn build_after_failed(&self) -> bool {
        self.record().build_after_failed
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.record().label = label.into();
    }

    /// Set from a `yyyyMMddHHmmss` timestamp.
    pub fn set_last_build(&self, timestamp: &str) -> Result<()> {
        let parsed = time::parse_timestamp(timestamp)?;
        self.record().last_build = parsed;
        Ok(())
    }

    /// Set from a `yyyyMMddHHmmss` timestamp.
    pub fn set_last_successful_build(&self, timestamp: &str) -> Result<()> {
        let parsed = time::parse_timestamp(timestamp)?;
        self.record().last_successful_build = parsed;
        Ok(())
    }

    pub fn set_last_build_successful(&self, value: bool) {
        self.record().last_build_successful = value;
    }

    pub fn set_build_after_failed(&self, value: bool) {
        self.record().build_after_failed = value;
    }

    pub fn set_build_start_time(&self, at: NaiveDateTime) {
        self.record().build_start_time = Some(at);
    }

    // -- timing -------------------------------------------------------------

    /// Wait from `now` until the next build attempt.
    pub fn time_to_next_build(&self, now: NaiveDateTime) -> Result<Duration> {
        let setup = self.setup_for("build()")?;
        let schedule = setup
            .schedule
            .as_ref()
            .ok_or_else(|| Error::IllegalState("project must have a schedule".into()))?;
        Ok(self.wait_from(schedule, now))
    }

    fn wait_from(&self, schedule: &Schedule, now: NaiveDateTime) -> Duration {
        let remaining = match self.build_start_time() {
            Some(started) => schedule.interval - (now - started),
            None => schedule.interval,
        };
        schedule.time_to_next_build(now, remaining)
    }

    /// True when failed attempts should only look at changes since the last
    /// attempt rather than since the last success.
    pub fn check_only_since_last_build(&self) -> bool {
        let record = self.record();
        if record.build_after_failed {
            return false;
        }
        record.last_build - record.last_successful_build > Duration::seconds(1)
    }

    /// Properties handed to the builder for a build starting at `now`.
    pub fn properties_map(&self, now: NaiveDateTime) -> BuildProperties {
        self.properties_with(now, self.is_forced())
    }

    fn properties_with(&self, now: NaiveDateTime, forced: bool) -> BuildProperties {
        let record = self.record();
        let mut props = BuildProperties::new();
        props.insert("projectname".into(), self.inner.name.clone());
        props.insert("label".into(), record.label.clone());
        props.insert("cctimestamp".into(), time::format_timestamp(&now));
        props.insert(
            "cclastbuildtimestamp".into(),
            time::format_timestamp(&record.last_build),
        );
        props.insert(
            "cclastgoodbuildtimestamp".into(),
            time::format_timestamp(&record.last_successful_build),
        );
        props.insert(
            "lastbuildsuccessful".into(),
            record.last_build_successful.to_string(),
        );
        props.insert("cvstimestamp".into(), time::format_cvs_timestamp(&now));
        props.insert("buildforced".into(), forced.to_string());
        props
    }

    // -- state machine ------------------------------------------------------

    async fn set_state(&self, state: ProjectState) {
        if !self.inner.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        }) {
            return;
        }
        debug!(project = %self.inner.name, state = %state, "Project state changed");
        self.inner
            .events
            .emit(ProjectEvent::BuildProgress(BuildProgressPayload {
                project: self.inner.name.clone(),
                state,
                at: Utc::now(),
            }))
            .await;
    }

    async fn run(self, queue: BuildQueue) {
        let mut control = self.inner.control.subscribe();
        loop {
            if !self.wait_if_paused(&mut control).await {
                break;
            }
            if !self.wait_for_next_build(&mut control).await {
                break;
            }
            let current = *control.borrow_and_update();
            if current.stop_requested {
                break;
            }
            if current.paused {
                continue;
            }

            self.inner.in_flight.send_replace(true);
            self.set_state(ProjectState::Queued).await;
            if !queue.request_build(Arc::new(self.clone())) {
                self.inner.in_flight.send_replace(false);
            }
            if !self.wait_for_build_to_finish(&mut control).await {
                break;
            }
        }
        debug!(project = %self.inner.name, "Scheduler loop exited");
    }

    /// Returns false once a stop is requested.
    async fn wait_if_paused(&self, control: &mut watch::Receiver<Control>) -> bool {
        loop {
            let current = *control.borrow_and_update();
            if current.stop_requested {
                return false;
            }
            if !current.paused {
                return true;
            }
            self.set_state(ProjectState::Paused).await;
            if control.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Returns false once a stop is requested.
    async fn wait_for_next_build(&self, control: &mut watch::Receiver<Control>) -> bool {
        let Some(setup) = self.setup() else {
            return false;
        };
        loop {
            let current = *control.borrow_and_update();
            if current.stop_requested {
                return false;
            }
            if current.forced || current.paused {
                return true;
            }

            let wait = match (&setup.schedule, setup.force_only) {
                (Some(schedule), false) => Some(self.wait_from(schedule, time::now())),
                _ => None,
            };
            if wait.is_some_and(|w| !need_to_wait(w)) {
                return true;
            }

            self.set_state(ProjectState::Waiting).await;
            let sleep = wait.and_then(|w| w.to_std().ok());
            if let Some(sleep) = sleep {
                debug!(project = %self.inner.name, wait_secs = sleep.as_secs(), "Waiting for next build");
            }
            tokio::select! {
                _ = sleep_for(sleep) => return true,
                changed = control.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Returns false once a stop is requested.
    async fn wait_for_build_to_finish(&self, control: &mut watch::Receiver<Control>) -> bool {
        let mut in_flight = self.inner.in_flight.subscribe();
        loop {
            if !*in_flight.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = in_flight.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() || control.borrow().stop_requested {
                        return false;
                    }
                }
            }
        }
    }

    // -- building -----------------------------------------------------------

    /// Run one build iteration: bootstrap, check for changes, dispatch,
    /// record the result and publish it.
    pub async fn build(&self) -> Result<()> {
        let setup = self.setup_for("build()")?;
        let Some(schedule) = setup.schedule.as_ref() else {
            return Err(Error::IllegalState("project must have a schedule".into()));
        };

        let _guard = self.inner.build_lock.lock().await;
        let outcome = self.run_build(&setup, schedule).await;

        let next = if self.control().stop_requested {
            ProjectState::Stopped
        } else {
            ProjectState::Idle
        };
        self.set_state(next).await;
        self.persist(&setup).await;
        outcome
    }

    async fn run_build(&self, setup: &ProjectSetup, schedule: &Schedule) -> Result<()> {
        let now = time::now();
        self.set_build_start_time(now);
        let forced = self.take_forced();

        if schedule.is_paused(&now) && !forced {
            info!(project = %self.inner.name, "Schedule is paused, not building");
            return Ok(());
        }

        self.set_state(ProjectState::Bootstrapping).await;
        for bootstrapper in &setup.bootstrappers {
            debug!(project = %self.inner.name, bootstrapper = bootstrapper.name(), "Bootstrapping");
            bootstrapper.bootstrap().await?;
        }

        self.set_state(ProjectState::ModificationCheck).await;
        let Some(check) = self.modifications_for(setup, forced).await? else {
            info!(project = %self.inner.name, "No modifications found, build not necessary");
            return Ok(());
        };

        let (counter, last_build, label) = {
            let record = self.record();
            (record.build_counter, record.last_build, record.label.clone())
        };
        let selected = schedule.select_build(counter, last_build, now).ok_or_else(|| {
            Error::Configuration(format!(
                "no build in the schedule of project {} applies to build {}",
                self.inner.name, counter
            ))
        })?;

        let mut properties = self.properties_with(now, forced);
        properties.extend(check.properties.clone());

        let build_id = BuildId::new();
        self.set_state(ProjectState::Building).await;
        info!(
            project = %self.inner.name,
            build_id = %build_id,
            label = %label,
            target = %selected.target.describe(),
            modifications = check.modifications.len(),
            "Building"
        );
        let outcome = setup
            .dispatcher
            .dispatch(DispatchRequest {
                build_id,
                project: &self.inner.name,
                target: &selected.target,
                properties: &properties,
                working_dir: setup.working_dir.clone(),
            })
            .await;
        let success = outcome.result.success;
        if !success {
            warn!(
                project = %self.inner.name,
                build_id = %build_id,
                reason = ?outcome.result.failure,
                "Build failed"
            );
        }

        self.inner
            .events
            .emit(ProjectEvent::BuildResult(BuildResultPayload {
                project: self.inner.name.clone(),
                build_id,
                label: label.clone(),
                success,
                at: Utc::now(),
            }))
            .await;

        self.set_state(ProjectState::MergingLogs).await;
        let log = BuildLog {
            build_id,
            project: self.inner.name.clone(),
            label,
            timestamp: now,
            info: properties,
            modifications: check.modifications,
            result: outcome.result,
            artifacts: outcome
                .artifacts
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        };
        if let Err(e) = resultlog::write(&setup.log_dir, &log).await {
            error!(project = %self.inner.name, error = %e, "Failed to write build log");
        }

        {
            let mut record = self.record();
            if success {
                record.last_successful_build = now;
                record.label = setup.label_incrementer.increment(&record.label);
            }
            record.last_build = now;
            record.last_build_successful = success;
            record.build_counter += 1;
        }

        self.set_state(ProjectState::Publishing).await;
        self.publish(&log).await;
        Ok(())
    }

    /// Changes that justify a build, or `None` if no build is needed.
    pub async fn get_modifications(&self, forced: bool) -> Result<Option<ModificationCheck>> {
        let setup = self.setup_for("build()")?;
        self.modifications_for(&setup, forced).await
    }

    async fn modifications_for(
        &self,
        setup: &ProjectSetup,
        forced: bool,
    ) -> Result<Option<ModificationCheck>> {
        let Some(detector) = &setup.detector else {
            let build = forced || !setup.require_modification;
            return Ok(build.then(|| ModificationCheck {
                time_of_check: Some(time::now()),
                ..Default::default()
            }));
        };

        let (last_build, last_successful, last_ok, after_failed) = {
            let record = self.record();
            (
                record.last_build,
                record.last_successful_build,
                record.last_build_successful,
                record.build_after_failed,
            )
        };

        if self.check_only_since_last_build() {
            debug!(project = %self.inner.name, "Checking only for changes since last build");
            let newer = detector.get_modifications(last_build).await?;
            if !newer.is_modified() && !forced {
                return Ok(None);
            }
        }

        let check = detector.get_modifications(last_successful).await?;
        if check.is_modified() {
            return Ok(Some(check));
        }
        if after_failed && !last_ok {
            info!(project = %self.inner.name, "Building anyway, last build failed");
        } else if forced {
            info!(project = %self.inner.name, "Building anyway, build was forced");
        } else if !setup.require_modification {
            debug!(project = %self.inner.name, "Building without modifications");
        } else {
            return Ok(None);
        }
        Ok(Some(check))
    }

    /// Hand the log to every publisher. Failures are logged, never fatal.
    pub async fn publish(&self, log: &BuildLog) {
        let Some(setup) = self.setup() else {
            return;
        };
        for publisher in &setup.publishers {
            if let Err(e) = publisher.publish(log).await {
                error!(
                    project = %self.inner.name,
                    publisher = publisher.name(),
                    error = %e,
                    "Publisher failed"
                );
            }
        }
    }

    async fn persist(&self, setup: &ProjectSetup) {
        let Some(dir) = &setup.state_dir else {
            return;
        };
        if let Err(e) = self.snapshot().save(dir).await {
            error!(project = %self.inner.name, error = %e, "Failed to save snapshot");
        }
    }
}

async fn sleep_for(wait: Option<std::time::Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Buildable for Project {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn execute(&self) {
        if let Err(e) = self.build().await {
            error!(project = %self.inner.name, error = %e, "Build iteration failed");
        }
        self.inner.in_flight.send_replace(false);
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Project {}: {}", self.inner.name, self.state().description())?;
        if self.is_paused() {
            f.write_str(" (paused)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{BuildTarget, ScheduledBuild, TimeOfDay};
    use cadence_core::build::{BuildContext, Modification, ResultDocument};
    use cadence_core::ports::{Builder, SourceControl};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Succeeding(AtomicUsize);

    #[async_trait]
    impl Builder for Succeeding {
        fn name(&self) -> &str {
            "succeeding"
        }

        async fn build(
            &self,
            _properties: &BuildProperties,
            _ctx: &BuildContext,
        ) -> Result<ResultDocument> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ResultDocument::success("succeeding"))
        }
    }

    struct Quiet;

    #[async_trait]
    impl SourceControl for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }

        async fn get_modifications(
            &self,
            _since: NaiveDateTime,
            _now: NaiveDateTime,
        ) -> Result<Vec<Modification>> {
            Ok(vec![])
        }
    }

    /// Remembers every window start it is asked about and reports one
    /// change at `changed_at`.
    struct Recording {
        changed_at: NaiveDateTime,
        sinces: Mutex<Vec<NaiveDateTime>>,
    }

    #[async_trait]
    impl SourceControl for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn get_modifications(
            &self,
            since: NaiveDateTime,
            now: NaiveDateTime,
        ) -> Result<Vec<Modification>> {
            self.sinces.lock().unwrap().push(since);
            if self.changed_at > since && self.changed_at <= now {
                Ok(vec![Modification::new("src/lib.rs", "alice", self.changed_at)])
            } else {
                Ok(vec![])
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl Publisher for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn publish(&self, _log: &BuildLog) -> Result<()> {
            Err(Error::Transport("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<String>>);

    #[async_trait]
    impl Publisher for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn publish(&self, log: &BuildLog) -> Result<()> {
            self.0.lock().unwrap().push(log.label.clone());
            Ok(())
        }
    }

    fn at(value: &str) -> NaiveDateTime {
        time::parse_timestamp(value).unwrap()
    }

    fn setup(dir: &std::path::Path, builder: Arc<Succeeding>) -> ProjectSetup {
        let dispatcher = Arc::new(BuildDispatcher::local(dir.join("artifacts")));
        ProjectSetup::new(dispatcher, dir.join("logs"))
            .with_schedule(Schedule::default().with_build(ScheduledBuild::every(BuildTarget::Local(builder))))
    }

    #[test]
    fn test_unconfigured_project_errors() {
        let project = Project::new("foo", EventHub::new());
        let err = project.init().unwrap_err();
        assert_eq!(
            err.to_string(),
            "projectConfig must be set on project before calling init()"
        );
    }

    #[tokio::test]
    async fn test_build_without_config_or_schedule() {
        let project = Project::new("foo", EventHub::new());
        let err = project.build().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "projectConfig must be set on project before calling build()"
        );

        let dir = tempfile::tempdir().unwrap();
        project.attach(ProjectSetup::new(
            Arc::new(BuildDispatcher::local(dir.path())),
            dir.path(),
        ));
        let err = project.build().await.unwrap_err();
        assert_eq!(err.to_string(), "project must have a schedule");
    }

    #[test]
    fn test_new_project_starts_at_midnight() {
        let project = Project::new("foo", EventHub::new());
        let midnight = time::now().date().and_time(NaiveTime::MIN);
        assert_eq!(project.last_build(), midnight);
        assert_eq!(project.last_successful_build(), midnight);
        assert_eq!(project.state(), ProjectState::Stopped);
        assert_eq!(project.to_string(), "Project foo: stopped");
        project.set_paused(true);
        assert_eq!(project.to_string(), "Project foo: stopped (paused)");
    }

    #[test]
    fn test_check_only_since_last_build() {
        let project = Project::new("foo", EventHub::new());
        project.set_last_build("20030101010101").unwrap();
        project.set_last_successful_build("20030101010101").unwrap();
        assert!(!project.check_only_since_last_build());

        project.set_last_build("20030202020202").unwrap();
        assert!(!project.check_only_since_last_build());

        project.set_build_after_failed(false);
        assert!(project.check_only_since_last_build());

        project.set_last_build("20030101010102").unwrap();
        assert!(!project.check_only_since_last_build());

        project.set_last_build("20020101010101").unwrap();
        assert!(!project.check_only_since_last_build());
    }

    #[test]
    fn test_bad_timestamp_is_rejected() {
        let project = Project::new("foo", EventHub::new());
        assert!(matches!(
            project.set_last_build("af32455432"),
            Err(Error::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_properties_map() {
        let project = Project::new("foo", EventHub::new());
        project.set_label("1.2.2");
        project.set_last_build("20011122110000").unwrap();
        project.set_last_successful_build("20011122100000").unwrap();
        project.set_last_build_successful(false);

        let props = project.properties_map(at("20011122120000"));
        assert_eq!(props["projectname"], "foo");
        assert_eq!(props["label"], "1.2.2");
        assert_eq!(props["cctimestamp"], "20011122120000");
        assert_eq!(props["cclastbuildtimestamp"], "20011122110000");
        assert_eq!(props["cclastgoodbuildtimestamp"], "20011122100000");
        assert_eq!(props["lastbuildsuccessful"], "false");
        assert_eq!(props["buildforced"], "false");
        assert!(props["cvstimestamp"].ends_with(" GMT"));
    }

    #[test]
    fn test_time_to_next_build_interval() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("foo", EventHub::new());
        project.attach(setup(dir.path(), Arc::new(Succeeding(AtomicUsize::new(0)))));

        let start = NaiveDate::from_ymd_opt(2001, 11, 22)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(project.time_to_next_build(start).unwrap(), Duration::seconds(300));

        project.set_build_start_time(start);
        let later = start + Duration::seconds(100);
        assert_eq!(project.time_to_next_build(later).unwrap(), Duration::seconds(200));
    }

    #[tokio::test]
    async fn test_no_detector_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("foo", EventHub::new());
        project.attach(setup(dir.path(), Arc::new(Succeeding(AtomicUsize::new(0)))));

        assert!(project.get_modifications(false).await.unwrap().is_none());
        assert!(project.get_modifications(true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unchanged_source_builds_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("foo", EventHub::new());
        project.attach(
            setup(dir.path(), Arc::new(Succeeding(AtomicUsize::new(0))))
                .with_detector(ModificationDetector::new(vec![Arc::new(Quiet)])),
        );

        assert!(project.get_modifications(false).await.unwrap().is_none());
        project.set_last_build_successful(false);
        assert!(project.get_modifications(false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unforced_build_without_changes_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(Succeeding(AtomicUsize::new(0)));
        let project = Project::new("foo", EventHub::new());
        project.attach(
            setup(dir.path(), builder.clone())
                .with_detector(ModificationDetector::new(vec![Arc::new(Quiet)])),
        );

        project.build().await.unwrap();
        assert_eq!(builder.0.load(Ordering::SeqCst), 0);
        assert_eq!(project.build_counter(), 0);
        assert_eq!(project.state(), ProjectState::Idle);

        project.force_build();
        project.build().await.unwrap();
        assert_eq!(builder.0.load(Ordering::SeqCst), 1);
        assert_eq!(project.build_counter(), 1);
        assert!(!project.is_forced());
    }

    #[tokio::test]
    async fn test_noon_build_waits_a_day() {
        let dir = tempfile::tempdir().unwrap();
        let builder: Arc<dyn Builder> = Arc::new(Succeeding(AtomicUsize::new(0)));
        let project = Project::new("foo", EventHub::new());
        project.attach(
            ProjectSetup::new(Arc::new(BuildDispatcher::local(dir.path())), dir.path()).with_schedule(
                Schedule::default().with_build(ScheduledBuild::at(
                    TimeOfDay::new(12, 0).unwrap(),
                    BuildTarget::Local(builder),
                )),
            ),
        );
        let noon = NaiveDate::from_ymd_opt(2001, 11, 22)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        project.set_build_start_time(noon);
        assert_eq!(
            project.time_to_next_build(noon + Duration::seconds(30)).unwrap(),
            Duration::days(1)
        );
    }

    fn failed_since_last_success(project: &Project) {
        project.set_last_successful_build("20030101010101").unwrap();
        project.set_last_build("20030202020202").unwrap();
        project.set_last_build_successful(false);
        project.set_build_after_failed(false);
    }

    #[tokio::test]
    async fn test_failed_project_only_rebuilds_for_newer_changes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(Succeeding(AtomicUsize::new(0)));
        let source = Arc::new(Recording {
            changed_at: at("20030115000000"),
            sinces: Mutex::new(Vec::new()),
        });
        let project = Project::new("foo", EventHub::new());
        project.attach(
            setup(dir.path(), builder.clone())
                .with_detector(ModificationDetector::new(vec![source.clone()])),
        );
        failed_since_last_success(&project);

        assert!(project.get_modifications(false).await.unwrap().is_none());
        assert_eq!(*source.sinces.lock().unwrap(), vec![at("20030202020202")]);

        project.build().await.unwrap();
        assert_eq!(builder.0.load(Ordering::SeqCst), 0);
        assert_eq!(project.last_build(), at("20030202020202"));
    }

    #[tokio::test]
    async fn test_newer_change_after_failure_fetches_since_last_success() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Recording {
            changed_at: at("20030301000000"),
            sinces: Mutex::new(Vec::new()),
        });
        let project = Project::new("foo", EventHub::new());
        project.attach(
            setup(dir.path(), Arc::new(Succeeding(AtomicUsize::new(0))))
                .with_detector(ModificationDetector::new(vec![source.clone()])),
        );
        failed_since_last_success(&project);

        let check = project.get_modifications(false).await.unwrap().unwrap();
        assert_eq!(check.modifications.len(), 1);
        assert_eq!(
            *source.sinces.lock().unwrap(),
            vec![at("20030202020202"), at("20030101010101")]
        );
    }

    #[tokio::test]
    async fn test_failing_publisher_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let collecting = Arc::new(Collecting::default());
        let project = Project::new("foo", EventHub::new());
        project.set_label("build.4");
        project.attach(
            setup(dir.path(), Arc::new(Succeeding(AtomicUsize::new(0))))
                .with_publisher(Arc::new(Broken))
                .with_publisher(collecting.clone()),
        );
        project.init().unwrap();

        project.force_build();
        project.build().await.unwrap();
        assert_eq!(*collecting.0.lock().unwrap(), vec!["build.4".to_string()]);
        assert!(project.is_last_build_successful());
        assert_eq!(project.label(), "build.5");
    }

    #[test]
    fn test_zero_interval_rejected_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let builder: Arc<dyn Builder> = Arc::new(Succeeding(AtomicUsize::new(0)));
        let project = Project::new("foo", EventHub::new());
        project.attach(
            ProjectSetup::new(Arc::new(BuildDispatcher::local(dir.path())), dir.path()).with_schedule(
                Schedule::new(Duration::zero()).with_build(ScheduledBuild::every(BuildTarget::Local(builder))),
            ),
        );
        assert!(matches!(project.init(), Err(Error::Configuration(_))));
    }
}
