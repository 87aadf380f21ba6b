//! Agent discovery and capability-matched selection with atomic claims.

use cadence_core::agent::{Advertisement, AgentFilter};
use cadence_core::build::{Artifact, BuildRequest, ResultDocument};
use cadence_core::ids::{AgentId, MasterId};
use cadence_core::ports::{AgentEntry, AgentService, Registrar, RegistrarLocator};
use cadence_core::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};

/// Tracks the registrars currently reachable through a fixed set of locators.
pub struct Discovery {
    locators: Vec<Arc<dyn RegistrarLocator>>,
    registrars: RwLock<Vec<Arc<dyn Registrar>>>,
    discovered: watch::Sender<bool>,
}

impl Discovery {
    pub fn new(locators: Vec<Arc<dyn RegistrarLocator>>) -> Self {
        let (discovered, _) = watch::channel(false);
        Self {
            locators,
            registrars: RwLock::new(Vec::new()),
            discovered,
        }
    }

    /// True once at least one registrar has answered, false while none is reachable.
    pub fn is_discovered(&self) -> bool {
        *self.discovered.borrow()
    }

    /// Watch reachability changes.
    pub fn watch_discovered(&self) -> watch::Receiver<bool> {
        self.discovered.subscribe()
    }

    /// Re-locate every registrar. Returns the number reachable.
    pub async fn refresh(&self) -> usize {
        let mut found = Vec::new();
        for locator in &self.locators {
            match locator.locate().await {
                Ok(registrar) if registrar.is_alive().await => {
                    debug!(locator = locator.url(), "Registrar located");
                    found.push(registrar);
                }
                Ok(_) => debug!(locator = locator.url(), "Registrar not answering"),
                Err(e) => debug!(locator = locator.url(), error = %e, "Registrar unreachable"),
            }
        }
        let count = found.len();
        *self.registrars.write().await = found;
        self.set_discovered(count > 0);
        count
    }

    fn set_discovered(&self, discovered: bool) {
        let changed = self.discovered.send_if_modified(|current| {
            let changed = *current != discovered;
            *current = discovered;
            changed
        });
        if changed {
            if discovered {
                info!("Agent discovery available");
            } else {
                warn!("No registrar reachable");
            }
        }
    }

    /// All build agents visible through any registrar whose attributes satisfy `filter`.
    pub async fn lookup(&self, filter: &AgentFilter) -> Result<Vec<AgentEntry>> {
        let none_known = self.registrars.read().await.is_empty();
        if none_known && self.refresh().await == 0 {
            return Err(Error::DiscoveryUnavailable);
        }

        let registrars = self.registrars.read().await.clone();
        let mut answered = 0usize;
        let mut seen: HashSet<AgentId> = HashSet::new();
        let mut entries = Vec::new();
        for registrar in registrars {
            match registrar.lookup(filter).await {
                Ok(found) => {
                    answered += 1;
                    for entry in found {
                        let ad = &entry.advertisement;
                        if ad.is_build_agent()
                            && filter.matches(&ad.attributes)
                            && seen.insert(ad.agent_id)
                        {
                            entries.push(entry);
                        }
                    }
                }
                Err(e) => warn!(locator = registrar.locator(), error = %e, "Registrar lookup failed"),
            }
        }

        if answered == 0 {
            self.set_discovered(false);
            self.registrars.write().await.clear();
            return Err(Error::DiscoveryUnavailable);
        }
        Ok(entries)
    }

    /// Periodically refresh until `shutdown` flips to true.
    pub fn spawn_refresh(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            info!(interval_secs = every.as_secs(), "Starting discovery refresh");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reachable = self.refresh().await;
                        debug!(reachable, "Discovery refreshed");
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Discovery refresh shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// How `pick_agent` behaves when no agent can be claimed right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    #[default]
    FailFast,
    Blocking {
        poll_interval: Duration,
        timeout: Duration,
    },
}

/// An agent this master holds a claim on. Release it with [`ClaimedAgent::release`].
pub struct ClaimedAgent {
    entry: AgentEntry,
    holder: MasterId,
}

impl ClaimedAgent {
    pub fn advertisement(&self) -> &Advertisement {
        &self.entry.advertisement
    }

    pub fn holder(&self) -> &MasterId {
        &self.holder
    }

    pub async fn build(&self, request: BuildRequest) -> Result<ResultDocument> {
        self.entry.service.do_build(&self.holder, request).await
    }

    pub async fn artifacts(&self) -> Result<Vec<Artifact>> {
        self.entry.service.retrieve_artifacts(&self.holder).await
    }

    /// Clear the agent's outputs, returning it to the available pool.
    pub async fn release(self) -> Result<()> {
        self.entry.service.clear_outputs(&self.holder).await?;
        debug!(agent = %self.entry.advertisement.name, "Agent released");
        Ok(())
    }
}

impl std::fmt::Debug for ClaimedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedAgent")
            .field("agent", &self.entry.advertisement.name)
            .field("holder", &self.holder)
            .finish()
    }
}

pub struct AgentPool {
    discovery: Arc<Discovery>,
    master: MasterId,
    policy: SelectionPolicy,
}

impl AgentPool {
    pub fn new(discovery: Arc<Discovery>, master: MasterId, policy: SelectionPolicy) -> Self {
        Self {
            discovery,
            master,
            policy,
        }
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn master(&self) -> &MasterId {
        &self.master
    }

    pub fn is_discovered(&self) -> bool {
        self.discovery.is_discovered()
    }

    /// Claim the first available agent matching `filter`.
    ///
    /// Fails with a no-capacity error when no registrar is reachable or every
    /// candidate is busy; with a blocking policy that happens only after the
    /// timeout.
    pub async fn pick_agent(&self, filter: &AgentFilter) -> Result<ClaimedAgent> {
        match self.policy {
            SelectionPolicy::FailFast => self.try_claim(filter).await,
            SelectionPolicy::Blocking {
                poll_interval,
                timeout,
            } => {
                let deadline = Instant::now() + timeout;
                loop {
                    match self.try_claim(filter).await {
                        Ok(agent) => return Ok(agent),
                        Err(e) if e.is_no_capacity() => {
                            let left = deadline.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                return Err(Error::NoCapacity(format!(
                                    "no agent claimed within {:?}: {}",
                                    timeout, e
                                )));
                            }
                            debug!(error = %e, "No agent yet, retrying");
                            tokio::time::sleep(poll_interval.min(left)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn try_claim(&self, filter: &AgentFilter) -> Result<ClaimedAgent> {
        let candidates = self.discovery.lookup(filter).await?;
        if candidates.is_empty() {
            return Err(Error::AgentUnavailable(
                "no build agent matches the requested attributes".into(),
            ));
        }

        let total = candidates.len();
        for entry in candidates {
            let name = entry.advertisement.name.clone();
            match entry.service.claim(&self.master).await {
                Ok(true) => {
                    info!(agent = %name, master = %self.master, "Claimed agent");
                    return Ok(ClaimedAgent {
                        entry,
                        holder: self.master.clone(),
                    });
                }
                Ok(false) => debug!(agent = %name, "Agent busy, trying next"),
                Err(e) => warn!(agent = %name, error = %e, "Claim attempt failed"),
            }
        }
        Err(Error::AgentUnavailable(format!(
            "all {} matching agents are busy",
            total
        )))
    }
}
