//! Agent configuration.

use crate::registrar::LocalRegistrar;
use cadence_core::{Error, Result};
use cadence_core::agent::Attributes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name shown in logs and build results.
    #[serde(default = "default_name")]
    pub name: String,
    /// Attributes masters filter on, e.g. `jdk: "17"`.
    #[serde(default)]
    pub attributes: Attributes,
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    /// Per-build workspaces are created under here.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// How often the announce loop renews the advertisement.
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    /// How long an advertisement stays valid without renewal.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cadence-agent".to_string())
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir().join("cadence-agent")
}

fn default_announce_interval() -> u64 {
    10
}

fn default_lease() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            attributes: Attributes::new(),
            nats_url: default_nats_url(),
            workspace_dir: default_workspace_dir(),
            announce_interval_secs: default_announce_interval(),
            lease_secs: default_lease(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// The announce loop must renew well inside the lease.
    pub fn validate(&self) -> Result<()> {
        if self.announce_interval_secs == 0 || self.announce_interval_secs >= self.lease_secs {
            return Err(Error::Configuration(format!(
                "announce_interval_secs ({}) must be positive and shorter than lease_secs ({})",
                self.announce_interval_secs, self.lease_secs
            )));
        }
        Ok(())
    }

    /// Registrar holding this agent's advertisement under `lease_secs`.
    pub fn local_registrar(&self) -> LocalRegistrar {
        LocalRegistrar::new(
            format!("local://{}", self.name),
            Duration::from_secs(self.lease_secs.max(1)),
        )
    }

    /// Configured attributes plus detected `os` and `arch`, unless overridden.
    pub fn effective_attributes(&self) -> Attributes {
        let mut attributes = self.attributes.clone();
        attributes
            .entry("os".into())
            .or_insert_with(|| std::env::consts::OS.to_string());
        attributes
            .entry("arch".into())
            .or_insert_with(|| std::env::consts::ARCH.to_string());
        attributes
    }
}
