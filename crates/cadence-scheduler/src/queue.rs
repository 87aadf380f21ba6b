//! Cross-project build queue with a fixed pool of worker tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something a queue worker can run.
#[async_trait]
pub trait Buildable: Send + Sync {
    fn name(&self) -> &str;

    /// Run one build. Errors are the implementor's to record.
    async fn execute(&self);
}

/// A pending build request.
#[derive(Clone)]
pub struct QueueEntry {
    pub project: Arc<dyn Buildable>,
    pub queued_at: DateTime<Utc>,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("project", &self.project.name())
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

struct QueueInner {
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// FIFO queue shared by all projects. Cloning yields another handle to the
/// same queue.
#[derive(Clone)]
pub struct BuildQueue {
    inner: Arc<QueueInner>,
}

impl Default for BuildQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildQueue {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                entries: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                shutdown_tx,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        // A poisoned queue still holds valid entries.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `threads` workers (at least one).
    pub fn start(&self, threads: usize) {
        let threads = threads.max(1);
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !workers.is_empty() {
            warn!("Build queue already started");
            return;
        }
        self.inner.shutdown_tx.send_replace(false);
        for worker in 0..threads {
            let queue = self.clone();
            let shutdown = self.inner.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                queue.service(worker, shutdown).await;
            }));
        }
        info!(threads, "Build queue started");
    }

    /// Append a project. Returns `false` if it is already waiting.
    pub fn request_build(&self, project: Arc<dyn Buildable>) -> bool {
        {
            let mut entries = self.entries();
            if entries.iter().any(|e| e.project.name() == project.name()) {
                debug!(project = %project.name(), "Project already queued");
                return false;
            }
            entries.push_back(QueueEntry {
                project: Arc::clone(&project),
                queued_at: Utc::now(),
            });
        }
        debug!(project = %project.name(), "Build requested");
        self.inner.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<QueueEntry> {
        self.entries().pop_front()
    }

    async fn service(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Queue worker waiting for builds");
        loop {
            while let Some(entry) = self.pop() {
                if *shutdown.borrow() {
                    // Put it back so it stays visible after shutdown.
                    self.entries().push_front(entry);
                    return;
                }
                info!(
                    worker,
                    project = %entry.project.name(),
                    waited_ms = (Utc::now() - entry.queued_at).num_milliseconds(),
                    "Dequeued build"
                );
                entry.project.execute().await;
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(worker, "Queue worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Stop servicing. In-flight builds complete; queued entries remain.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Queue worker ended abnormally");
            }
        }
        info!(pending = self.len(), "Build queue stopped");
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Names of waiting projects, front first.
    pub fn pending(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|e| e.project.name().to_string())
            .collect()
    }
}
