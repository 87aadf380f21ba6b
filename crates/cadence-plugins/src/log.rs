//! Publisher and listener that write to the tracing log.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::build::BuildLog;
use cadence_core::events::ProjectEvent;
use cadence_core::ports::{Listener, Publisher};
use tracing::{debug, info, warn};

pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, log: &BuildLog) -> Result<()> {
        if log.is_successful() {
            info!(
                project = %log.project,
                label = %log.label,
                build_id = %log.build_id,
                modifications = log.modifications.len(),
                "Build successful"
            );
        } else {
            let reason = log
                .result
                .failure
                .as_ref()
                .map(|f| f.message.as_str())
                .unwrap_or("unknown");
            warn!(
                project = %log.project,
                label = %log.label,
                build_id = %log.build_id,
                reason,
                "Build failed"
            );
        }
        Ok(())
    }
}

pub struct LogListener;

#[async_trait]
impl Listener for LogListener {
    fn name(&self) -> &str {
        "log"
    }

    async fn project_added(&self, project: &str) -> Result<()> {
        info!(project, "Project added");
        Ok(())
    }

    async fn project_removed(&self, project: &str) -> Result<()> {
        info!(project, "Project removed");
        Ok(())
    }

    async fn handle_event(&self, event: &ProjectEvent) -> Result<()> {
        debug!(subject = %event.subject(), "Project event");
        Ok(())
    }
}
