//! Fan-out of project events to listeners and broadcast subscribers.

use cadence_core::events::{ProjectEvent, ProjectPayload};
use cadence_core::ports::Listener;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{trace, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Delivers events to registered listeners in order, then to any broadcast
/// subscribers. A failing listener is logged and skipped.
#[derive(Clone)]
pub struct EventHub {
    listeners: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
    sender: broadcast::Sender<ProjectEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self::with_sender(sender)
    }

    /// Share an existing broadcast channel, e.g. one owned by a controller.
    pub fn with_sender(sender: broadcast::Sender<ProjectEvent>) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            sender,
        }
    }

    pub fn set_listeners(&self, listeners: Vec<Arc<dyn Listener>>) {
        match self.listeners.write() {
            Ok(mut current) => *current = listeners,
            Err(poisoned) => *poisoned.into_inner() = listeners,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        match self.listeners.write() {
            Ok(mut current) => current.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        match self.listeners.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ProjectEvent> {
        self.sender.clone()
    }

    pub async fn emit(&self, event: ProjectEvent) {
        trace!(subject = %event.subject(), "Emitting event");
        for listener in self.snapshot() {
            if let Err(e) = listener.handle_event(&event).await {
                warn!(
                    listener = listener.name(),
                    subject = %event.subject(),
                    error = %e,
                    "Listener failed to handle event"
                );
            }
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub async fn project_added(&self, project: &str) {
        for listener in self.snapshot() {
            if let Err(e) = listener.project_added(project).await {
                warn!(listener = listener.name(), project, error = %e, "Listener failed on project added");
            }
        }
        let _ = self.sender.send(ProjectEvent::ProjectAdded(ProjectPayload {
            project: project.to_string(),
            at: Utc::now(),
        }));
    }

    pub async fn project_removed(&self, project: &str) {
        for listener in self.snapshot() {
            if let Err(e) = listener.project_removed(project).await {
                warn!(listener = listener.name(), project, error = %e, "Listener failed on project removed");
            }
        }
        let _ = self.sender.send(ProjectEvent::ProjectRemoved(ProjectPayload {
            project: project.to_string(),
            at: Utc::now(),
        }));
    }
}
