//! A project driven through the queue from start to published result.

use cadence_core::events::{ProjectEvent, ProjectState};
use cadence_plugins::{DefaultLabelIncrementer, ExecBuilder};
use cadence_scheduler::events::EventHub;
use cadence_scheduler::schedule::{BuildTarget, Schedule, ScheduledBuild};
use cadence_scheduler::snapshot::ProjectSnapshot;
use cadence_scheduler::{BuildDispatcher, BuildQueue, Project, ProjectSetup};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

fn setup(command: &str, root: &Path) -> ProjectSetup {
    let schedule = Schedule::new(chrono::Duration::seconds(300)).with_build(
        ScheduledBuild::every(BuildTarget::Local(Arc::new(ExecBuilder::new(command)))),
    );
    ProjectSetup::new(
        Arc::new(BuildDispatcher::local(root.join("artifacts"))),
        root.join("logs"),
    )
    .with_schedule(schedule)
    .with_label_incrementer(Arc::new(DefaultLabelIncrementer::default()))
    .with_state_dir(root.join("state"))
    .force_only(true)
}

/// Progress states and result flags up to the project's return to idle after
/// a build result.
async fn collect_build(rx: &mut broadcast::Receiver<ProjectEvent>) -> (Vec<ProjectState>, Vec<bool>) {
    let mut states = Vec::new();
    let mut results = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for project events")
            .expect("event channel closed");
        match event {
            ProjectEvent::BuildProgress(p) => {
                states.push(p.state);
                if p.state == ProjectState::Idle && !results.is_empty() {
                    return (states, results);
                }
            }
            ProjectEvent::BuildResult(r) => results.push(r.success),
            _ => {}
        }
    }
}

async fn wait_until_waiting(project: &Project) {
    let mut state = project.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ProjectState::Waiting),
    )
    .await
    .expect("project never reached waiting")
    .expect("state channel closed");
}

#[tokio::test]
async fn test_forced_build_increments_label_and_reports_once() {
    let root = tempfile::tempdir().unwrap();
    let queue = BuildQueue::new();
    queue.start(1);

    let project = Project::new("core", EventHub::new());
    project.set_label("1.2.2");
    project.attach(setup("true", root.path()));
    assert_ok!(project.init());
    let mut events = project.subscribe();

    assert_ok!(project.start(queue.clone()).await);
    wait_until_waiting(&project).await;
    project.force_build();

    let (states, results) = collect_build(&mut events).await;
    assert_eq!(results, vec![true]);
    assert_eq!(
        states,
        vec![
            ProjectState::Idle,
            ProjectState::Waiting,
            ProjectState::Queued,
            ProjectState::Bootstrapping,
            ProjectState::ModificationCheck,
            ProjectState::Building,
            ProjectState::MergingLogs,
            ProjectState::Publishing,
            ProjectState::Idle,
        ]
    );
    assert_eq!(project.label(), "1.2.3");
    assert_eq!(project.build_counter(), 1);
    assert!(project.is_last_build_successful());
    assert!(!project.is_forced());

    let logs: Vec<_> = std::fs::read_dir(root.path().join("logs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].starts_with("log") && logs[0].ends_with("L1.2.2.json"));

    project.stop().await;
    assert_eq!(project.state(), ProjectState::Stopped);
    queue.shutdown().await;
}

#[tokio::test]
async fn test_failed_build_keeps_label() {
    let root = tempfile::tempdir().unwrap();
    let queue = BuildQueue::new();
    queue.start(1);

    let project = Project::new("broken", EventHub::new());
    project.attach(setup("exit 3", root.path()));
    assert_ok!(project.init());
    let mut events = project.subscribe();

    assert_ok!(project.start(queue.clone()).await);
    wait_until_waiting(&project).await;
    project.force_build();

    let (_, results) = collect_build(&mut events).await;
    assert_eq!(results, vec![false]);
    assert_eq!(project.label(), "build.1");
    assert!(!project.is_last_build_successful());
    assert_eq!(project.build_counter(), 1);

    let logs: Vec<_> = std::fs::read_dir(root.path().join("logs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].contains('L'));

    project.stop().await;
    queue.shutdown().await;
}

#[tokio::test]
async fn test_restored_project_resumes_scheduling() {
    let root = tempfile::tempdir().unwrap();
    let queue = BuildQueue::new();
    queue.start(1);

    let project = Project::new("core", EventHub::new());
    project.attach(setup("true", root.path()));
    assert_ok!(project.init());
    let mut events = project.subscribe();
    assert_ok!(project.start(queue.clone()).await);
    wait_until_waiting(&project).await;
    project.force_build();
    collect_build(&mut events).await;
    project.stop().await;

    let state_dir = root.path().join("state");
    let saved = assert_ok!(ProjectSnapshot::load_named(&state_dir, "core").await)
        .expect("snapshot saved after build");
    assert_eq!(saved.label, "build.2");
    assert_eq!(saved.build_counter, 1);
    assert!(!saved.paused);

    project.set_paused(true);
    assert_ok!(project.snapshot().save(&state_dir).await);
    let snapshot = assert_ok!(ProjectSnapshot::load_named(&state_dir, "core").await)
        .expect("snapshot");

    let restored = Project::restore(snapshot, EventHub::new());
    restored.attach(setup("true", root.path()));
    assert_ok!(restored.init());
    assert!(restored.is_paused());
    assert_eq!(restored.label(), "build.2");

    assert_ok!(restored.start(queue.clone()).await);
    assert!(restored.is_running());
    let mut state = restored.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ProjectState::Paused),
    )
    .await
    .expect("restored project never paused")
    .expect("state channel closed");

    restored.stop().await;
    assert!(!restored.is_running());
    queue.shutdown().await;
}
