//! In-process registrar with expiring advertisement leases.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::agent::{Advertisement, AgentFilter};
use cadence_core::ids::AgentId;
use cadence_core::ports::{AgentEntry, AgentService, Registrar, RegistrarLocator};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct Registration {
    entry: AgentEntry,
    expires_at: Instant,
}

/// Agents register here and must renew before their lease runs out.
pub struct LocalRegistrar {
    locator: String,
    lease: Duration,
    registrations: RwLock<HashMap<AgentId, Registration>>,
}

impl LocalRegistrar {
    pub fn new(locator: impl Into<String>, lease: Duration) -> Self {
        Self {
            locator: locator.into(),
            lease,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Add or renew an agent's advertisement.
    pub fn register(&self, advertisement: Advertisement, service: Arc<dyn AgentService>) {
        let agent_id = advertisement.agent_id;
        let name = advertisement.name.clone();
        let expires_at = Instant::now() + self.lease;
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let renewed = registrations
            .insert(
                agent_id,
                Registration {
                    entry: AgentEntry {
                        advertisement,
                        service,
                    },
                    expires_at,
                },
            )
            .is_some();
        if renewed {
            debug!(agent = %name, "Advertisement renewed");
        } else {
            info!(agent = %name, agent_id = %agent_id, "Agent registered");
        }
    }

    pub fn deregister(&self, agent_id: &AgentId) -> bool {
        let removed = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(agent_id)
            .is_some();
        if removed {
            info!(agent_id = %agent_id, "Agent deregistered");
        }
        removed
    }

    /// Live registrations; expired ones are dropped.
    pub fn entries(&self) -> Vec<AgentEntry> {
        let now = Instant::now();
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registrations.retain(|agent_id, r| {
            let live = r.expires_at > now;
            if !live {
                info!(agent_id = %agent_id, agent = %r.entry.advertisement.name, "Advertisement lease expired");
            }
            live
        });
        let mut entries: Vec<_> = registrations.values().map(|r| r.entry.clone()).collect();
        entries.sort_by(|a, b| a.advertisement.name.cmp(&b.advertisement.name));
        entries
    }

    /// Whether `agent_id` holds an unexpired advertisement.
    pub fn is_registered(&self, agent_id: &AgentId) -> bool {
        self.entries()
            .iter()
            .any(|e| &e.advertisement.agent_id == agent_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A locator that always finds this registrar.
    pub fn locator_for(self: &Arc<Self>) -> Arc<dyn RegistrarLocator> {
        Arc::new(FixedLocator {
            url: self.locator.clone(),
            registrar: Arc::clone(self) as Arc<dyn Registrar>,
        })
    }
}

#[async_trait]
impl Registrar for LocalRegistrar {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn lookup(&self, filter: &AgentFilter) -> Result<Vec<AgentEntry>> {
        Ok(self
            .entries()
            .into_iter()
            .filter(|e| e.advertisement.is_build_agent() && filter.matches(&e.advertisement.attributes))
            .collect())
    }
}

/// Locates a registrar that is already known.
pub struct FixedLocator {
    url: String,
    registrar: Arc<dyn Registrar>,
}

impl FixedLocator {
    pub fn new(url: impl Into<String>, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            url: url.into(),
            registrar,
        }
    }
}

#[async_trait]
impl RegistrarLocator for FixedLocator {
    fn url(&self) -> &str {
        &self.url
    }

    async fn locate(&self) -> Result<Arc<dyn Registrar>> {
        Ok(Arc::clone(&self.registrar))
    }
}
