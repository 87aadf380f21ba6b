//! Announce loop that keeps an agent's advertisement lease alive.

use crate::registrar::LocalRegistrar;
use crate::service::BuildAgentService;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, interval};
use tracing::{debug, info};

/// Re-registers the agent every interval and whenever its phase changes, so
/// the advertised busy flag stays current.
pub struct AnnounceService {
    agent: Arc<BuildAgentService>,
    registrar: Arc<LocalRegistrar>,
    interval_secs: u64,
}

impl AnnounceService {
    pub fn new(agent: Arc<BuildAgentService>, registrar: Arc<LocalRegistrar>, interval_secs: u64) -> Self {
        Self {
            agent,
            registrar,
            interval_secs,
        }
    }

    /// Run until shutdown, then withdraw the advertisement.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        let mut phase = self.agent.watch_phase();

        info!(
            agent = %self.agent.name(),
            interval_secs = self.interval_secs,
            "Starting announce service"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.announce(),
                changed = phase.changed() => {
                    if changed.is_ok() {
                        self.announce();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Announce service shutting down");
                        break;
                    }
                }
            }
        }
        self.registrar.deregister(&self.agent.agent_id());
    }

    fn announce(&self) {
        let agent = Arc::clone(&self.agent);
        self.registrar.register(agent.advertisement(), agent);
        debug!(agent = %self.agent.name(), "Advertisement announced");
    }
}
