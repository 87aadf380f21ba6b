//! Configuration for the NATS transport.

use cadence_core::{Error, Result};
use std::time::Duration;
use tracing::info;

/// Configuration for NATS connections used by masters and agents.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs (comma-joined when connecting to a cluster).
    pub urls: Vec<String>,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Timeout for short agent requests (claim, busy, clear).
    pub request_timeout: Duration,
    /// Timeout for a remote build request.
    pub build_timeout: Duration,
    /// How long a lookup collects advertisements.
    pub lookup_window: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            build_timeout: Duration::from_secs(3600),
            lookup_window: Duration::from_millis(500),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_lookup_window(mut self, window: Duration) -> Self {
        self.lookup_window = window;
        self
    }

    pub fn url(&self) -> String {
        self.urls.join(",")
    }

    /// Connect to the configured servers.
    pub async fn connect(&self) -> Result<async_nats::Client> {
        let urls = self.url();
        info!("Connecting to NATS at {}", urls);

        async_nats::ConnectOptions::new()
            .connection_timeout(self.connection_timeout)
            .request_timeout(Some(self.request_timeout))
            .connect(&urls)
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to NATS: {}", e)))
    }
}
