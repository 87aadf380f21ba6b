//! Publishes the build log as JSON to an HTTP endpoint.

use async_trait::async_trait;
use cadence_core::build::BuildLog;
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::Publisher;
use cadence_core::{Error, Result};
use std::time::Duration;
use tracing::{debug, info};

pub struct WebhookPublisher {
    url: String,
    client: reqwest::Client,
}

impl WebhookPublisher {
    /// Parameters: `url` (required), `timeout_secs` (default 10).
    pub fn from_spec(spec: &PluginSpec) -> Result<Self> {
        let url = spec.require_str("url")?;
        let timeout = Duration::from_secs(spec.get_u64("timeout_secs")?.unwrap_or(10));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("webhook client: {}", e)))?;
        Ok(Self { url, client })
    }

    fn publish_error(&self, message: String) -> Error {
        Error::Publish {
            publisher: "webhook".to_string(),
            message,
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, log: &BuildLog) -> Result<()> {
        debug!(url = %self.url, project = %log.project, "Sending build log to webhook");

        let response = self
            .client
            .post(&self.url)
            .json(log)
            .send()
            .await
            .map_err(|e| self.publish_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.publish_error(format!("{}: {}", status, body)));
        }

        info!(project = %log.project, label = %log.label, "Webhook notified");
        Ok(())
    }
}
