//! Agent types shared by masters and agents.

use crate::ids::{AgentId, MasterId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability attributes an agent advertises, e.g. `os=linux`, `jdk=17`.
pub type Attributes = BTreeMap<String, String>;

/// Attribute every agent advertises so lookups can select build services.
pub const BUILD_CAPABILITY_KEY: &str = "service";
pub const BUILD_CAPABILITY_VALUE: &str = "build-agent";

/// Attribute-equality filter applied to advertisements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentFilter {
    pub attributes: Attributes,
}

impl AgentFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Every filter entry must be present with an equal value.
    pub fn matches(&self, advertised: &Attributes) -> bool {
        self.attributes
            .iter()
            .all(|(k, v)| advertised.get(k) == Some(v))
    }
}

/// What an agent publishes about itself to registrars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub agent_id: AgentId,
    pub name: String,
    pub attributes: Attributes,
    pub busy: bool,
}

impl Advertisement {
    pub fn new(agent_id: AgentId, name: impl Into<String>, mut attributes: Attributes) -> Self {
        attributes.insert(
            BUILD_CAPABILITY_KEY.to_string(),
            BUILD_CAPABILITY_VALUE.to_string(),
        );
        Self {
            agent_id,
            name: name.into(),
            attributes,
            busy: false,
        }
    }

    pub fn is_build_agent(&self) -> bool {
        self.attributes.get(BUILD_CAPABILITY_KEY).map(String::as_str)
            == Some(BUILD_CAPABILITY_VALUE)
    }
}

/// Exclusive right of one master to use one agent, held until release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub agent_id: AgentId,
    pub holder: MasterId,
    pub acquired_at: DateTime<Utc>,
}

/// Where an agent is in the claim protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Available,
    Claimed,
    Building,
    /// The build finished; results wait to be collected and cleared.
    OutputsPending,
}

impl AgentPhase {
    pub fn is_busy(&self) -> bool {
        !matches!(self, AgentPhase::Available)
    }
}
