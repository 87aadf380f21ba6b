//! Agent-side responder: answers discovery lookups and serves the claim
//! protocol for one [`BuildAgentService`].

use crate::protocol::{self, BuildCall, LookupRequest, MasterRequest, RemoteError, Reply};
use crate::subjects::{self, AgentOp};
use cadence_agent::{BuildAgentService, LocalRegistrar};
use cadence_core::agent::{Advertisement, AgentFilter};
use cadence_core::ports::AgentService;
use cadence_core::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct AgentEndpoint {
    client: async_nats::Client,
    agent: Arc<BuildAgentService>,
    registrar: Option<Arc<LocalRegistrar>>,
}

impl AgentEndpoint {
    pub fn new(client: async_nats::Client, agent: Arc<BuildAgentService>) -> Self {
        Self {
            client,
            agent,
            registrar: None,
        }
    }

    /// Only answer lookups while the agent's advertisement lease in
    /// `registrar` is live.
    pub fn with_registrar(mut self, registrar: Arc<LocalRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Serve until shutdown. Each protocol request runs on its own task so
    /// lookups and `busy` queries are answered while a build is running.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let agent_id = self.agent.agent_id();
        let mut lookups = self
            .client
            .subscribe(subjects::DISCOVERY_LOOKUP)
            .await
            .map_err(|e| Error::Transport(format!("Failed to subscribe to lookups: {}", e)))?;
        let mut requests = self
            .client
            .subscribe(subjects::agent_wildcard(&agent_id))
            .await
            .map_err(|e| Error::Transport(format!("Failed to subscribe to requests: {}", e)))?;

        info!(
            agent = %self.agent.name(),
            agent_id = %agent_id,
            "Agent endpoint listening"
        );

        loop {
            tokio::select! {
                Some(msg) = lookups.next() => self.answer_lookup(msg).await,
                Some(msg) = requests.next() => {
                    let client = self.client.clone();
                    let agent = Arc::clone(&self.agent);
                    tokio::spawn(async move { handle_request(client, agent, msg).await });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Agent endpoint shutting down");
                        break;
                    }
                }
                else => {
                    warn!("NATS subscriptions closed");
                    break;
                }
            }
        }

        if let Err(e) = lookups.unsubscribe().await {
            debug!("Failed to unsubscribe lookups: {}", e);
        }
        if let Err(e) = requests.unsubscribe().await {
            debug!("Failed to unsubscribe requests: {}", e);
        }
        Ok(())
    }

    async fn answer_lookup(&self, msg: async_nats::Message) {
        let Some(reply) = msg.reply else {
            return;
        };
        let request: LookupRequest = if msg.payload.is_empty() {
            LookupRequest::default()
        } else {
            match protocol::decode(&msg.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Ignoring malformed lookup: {}", e);
                    return;
                }
            }
        };

        let Some(advertisement) =
            lookup_answer(&self.agent, self.registrar.as_deref(), &request.filter)
        else {
            return;
        };
        let payload = match protocol::encode(&advertisement) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode advertisement: {}", e);
                return;
            }
        };
        if let Err(e) = self.client.publish(reply, payload.into()).await {
            warn!("Failed to answer lookup: {}", e);
        }
    }
}

fn lookup_answer(
    agent: &BuildAgentService,
    registrar: Option<&LocalRegistrar>,
    filter: &AgentFilter,
) -> Option<Advertisement> {
    if let Some(registrar) = registrar {
        if !registrar.is_registered(&agent.agent_id()) {
            debug!(agent = %agent.name(), "Advertisement lease lapsed, not answering lookup");
            return None;
        }
    }
    let advertisement = agent.advertisement();
    (advertisement.is_build_agent() && filter.matches(&advertisement.attributes))
        .then_some(advertisement)
}

async fn handle_request(
    client: async_nats::Client,
    agent: Arc<BuildAgentService>,
    msg: async_nats::Message,
) {
    let Some(reply) = msg.reply.clone() else {
        warn!(subject = %msg.subject, "Protocol request without reply subject");
        return;
    };

    let payload = match subjects::parse_op(msg.subject.as_str()) {
        Some(op) => {
            debug!(agent = %agent.name(), op = %op, "Protocol request");
            respond(&agent, op, &msg.payload).await
        }
        None => Err(Error::Transport(format!("unknown operation on {}", msg.subject))),
    };

    let payload = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!(subject = %msg.subject, "Rejecting request: {}", e);
            match protocol::encode(&Reply::<()>::Err(RemoteError::bad_request(e.to_string()))) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode rejection: {}", e);
                    return;
                }
            }
        }
    };

    if let Err(e) = client.publish(reply, payload.into()).await {
        warn!("Failed to send reply: {}", e);
    }
}

/// Errors returned here mean the request itself was unusable; service
/// failures travel inside the [`Reply`].
async fn respond(agent: &BuildAgentService, op: AgentOp, payload: &[u8]) -> Result<Vec<u8>> {
    match op {
        AgentOp::Claim => {
            let request: MasterRequest = protocol::decode(payload)?;
            protocol::encode(&Reply::from_result(agent.claim(&request.master).await))
        }
        AgentOp::Busy => protocol::encode(&Reply::from_result(agent.is_busy().await)),
        AgentOp::Lease => protocol::encode(&Reply::from_result(agent.lease().await)),
        AgentOp::Build => {
            let call: BuildCall = protocol::decode(payload)?;
            protocol::encode(&Reply::from_result(
                agent.do_build(&call.master, call.request).await,
            ))
        }
        AgentOp::Artifacts => {
            let request: MasterRequest = protocol::decode(payload)?;
            protocol::encode(&Reply::from_result(
                agent.retrieve_artifacts(&request.master).await,
            ))
        }
        AgentOp::Clear => {
            let request: MasterRequest = protocol::decode(payload)?;
            protocol::encode(&Reply::from_result(agent.clear_outputs(&request.master).await))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::agent::Attributes;
    use cadence_plugins::PluginRegistry;
    use std::time::Duration;

    fn linux_agent(dir: &std::path::Path) -> Arc<BuildAgentService> {
        let mut attributes = Attributes::new();
        attributes.insert("os".into(), "linux".into());
        Arc::new(BuildAgentService::new(
            "agent-1",
            attributes,
            PluginRegistry::builtin(),
            dir,
        ))
    }

    #[test]
    fn test_lookup_answer_follows_filter() {
        let dir = tempfile::tempdir().unwrap();
        let agent = linux_agent(dir.path());
        assert!(lookup_answer(&agent, None, &AgentFilter::any().with("os", "linux")).is_some());
        assert!(lookup_answer(&agent, None, &AgentFilter::any().with("os", "windows")).is_none());
    }

    #[tokio::test]
    async fn test_lookup_answer_needs_live_lease() {
        let dir = tempfile::tempdir().unwrap();
        let agent = linux_agent(dir.path());
        let registrar = LocalRegistrar::new("local://agent-1", Duration::from_millis(50));
        assert!(lookup_answer(&agent, Some(&registrar), &AgentFilter::any()).is_none());

        registrar.register(agent.advertisement(), Arc::clone(&agent) as Arc<dyn AgentService>);
        let answer = lookup_answer(&agent, Some(&registrar), &AgentFilter::any()).unwrap();
        assert_eq!(answer.agent_id, agent.agent_id());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(lookup_answer(&agent, Some(&registrar), &AgentFilter::any()).is_none());
    }
}
