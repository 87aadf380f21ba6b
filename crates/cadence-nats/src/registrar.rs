//! Master-side discovery over NATS.

use crate::config::NatsConfig;
use crate::protocol::{self, BuildCall, Empty, LookupRequest, MasterRequest, Reply};
use crate::subjects::{self, AgentOp};
use async_nats::client::RequestErrorKind;
use async_trait::async_trait;
use cadence_core::agent::{Advertisement, AgentFilter, ClaimLease};
use cadence_core::build::{Artifact, BuildRequest, ResultDocument};
use cadence_core::ids::{AgentId, MasterId};
use cadence_core::ports::{AgentEntry, AgentService, Registrar, RegistrarLocator};
use cadence_core::{Error, Result};
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn is_connected(client: &async_nats::Client) -> bool {
    client.connection_state() == async_nats::connection::State::Connected
}

/// Locates the registrar reachable through one NATS server (or cluster).
/// The connection is opened on first use and reused afterwards.
pub struct NatsLocator {
    url: String,
    config: NatsConfig,
    client: Mutex<Option<async_nats::Client>>,
}

impl NatsLocator {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            url: config.url(),
            config,
            client: Mutex::new(None),
        }
    }

    /// Reuse an existing connection.
    pub fn with_client(config: NatsConfig, client: async_nats::Client) -> Self {
        Self {
            url: config.url(),
            config,
            client: Mutex::new(Some(client)),
        }
    }
}

#[async_trait]
impl RegistrarLocator for NatsLocator {
    fn url(&self) -> &str {
        &self.url
    }

    async fn locate(&self) -> Result<Arc<dyn Registrar>> {
        let client = {
            let mut slot = self.client.lock().await;
            match slot.as_ref() {
                Some(client) => client.clone(),
                None => {
                    let client = self.config.connect().await?;
                    *slot = Some(client.clone());
                    client
                }
            }
        };

        if !is_connected(&client) {
            return Err(Error::Transport(format!("not connected to {}", self.url)));
        }
        Ok(Arc::new(NatsRegistrar::new(
            self.url.clone(),
            client,
            self.config.clone(),
        )))
    }
}

/// Scatter-gather lookup: publish on the discovery subject and collect every
/// advertisement that arrives within the lookup window.
pub struct NatsRegistrar {
    locator: String,
    client: async_nats::Client,
    config: NatsConfig,
}

impl NatsRegistrar {
    pub fn new(locator: impl Into<String>, client: async_nats::Client, config: NatsConfig) -> Self {
        Self {
            locator: locator.into(),
            client,
            config,
        }
    }

    async fn collect(&self, filter: &AgentFilter) -> Result<Vec<Advertisement>> {
        let inbox = self.client.new_inbox();
        let mut replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| Error::Transport(format!("Failed to subscribe to lookup replies: {}", e)))?;

        let payload = protocol::encode(&LookupRequest {
            filter: filter.clone(),
        })?;
        self.client
            .publish_with_reply(subjects::DISCOVERY_LOOKUP, inbox, payload.into())
            .await
            .map_err(|e| Error::Transport(format!("Failed to publish lookup: {}", e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("Failed to flush lookup: {}", e)))?;

        let mut seen = HashSet::new();
        let mut advertisements = Vec::new();
        let window = tokio::time::sleep(self.config.lookup_window);
        tokio::pin!(window);

        loop {
            tokio::select! {
                msg = replies.next() => {
                    let Some(msg) = msg else { break };
                    match protocol::decode::<Advertisement>(&msg.payload) {
                        Ok(ad) => {
                            if seen.insert(ad.agent_id) {
                                advertisements.push(ad);
                            }
                        }
                        Err(e) => warn!("Ignoring malformed advertisement: {}", e),
                    }
                }
                _ = &mut window => break,
            }
        }

        if let Err(e) = replies.unsubscribe().await {
            debug!("Failed to unsubscribe lookup inbox: {}", e);
        }
        Ok(advertisements)
    }
}

#[async_trait]
impl Registrar for NatsRegistrar {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn is_alive(&self) -> bool {
        is_connected(&self.client)
    }

    async fn lookup(&self, filter: &AgentFilter) -> Result<Vec<AgentEntry>> {
        let mut advertisements: Vec<_> = self
            .collect(filter)
            .await?
            .into_iter()
            .filter(|ad| ad.is_build_agent() && filter.matches(&ad.attributes))
            .collect();
        advertisements.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(
            locator = %self.locator,
            found = advertisements.len(),
            "Lookup complete"
        );

        Ok(advertisements
            .into_iter()
            .map(|advertisement| {
                let service: Arc<dyn AgentService> = Arc::new(RemoteAgent::new(
                    advertisement.agent_id,
                    advertisement.name.clone(),
                    self.client.clone(),
                    &self.config,
                ));
                AgentEntry {
                    advertisement,
                    service,
                }
            })
            .collect())
    }
}

/// An agent reached through per-agent request/reply subjects.
pub struct RemoteAgent {
    agent_id: AgentId,
    name: String,
    client: async_nats::Client,
    request_timeout: Duration,
    build_timeout: Duration,
}

impl RemoteAgent {
    pub fn new(
        agent_id: AgentId,
        name: impl Into<String>,
        client: async_nats::Client,
        config: &NatsConfig,
    ) -> Self {
        Self {
            agent_id,
            name: name.into(),
            client,
            request_timeout: config.request_timeout,
            build_timeout: config.build_timeout,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    async fn call<Req, Resp>(&self, op: AgentOp, body: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let payload = protocol::encode(body)?;
        let request = async_nats::Request::new()
            .payload(payload.into())
            .timeout(Some(timeout));
        let message = self
            .client
            .send_request(subjects::agent_subject(&self.agent_id, op), request)
            .await
            .map_err(|e| match e.kind() {
                RequestErrorKind::TimedOut => {
                    Error::Timeout(format!("{} request to agent {}", op, self.name))
                }
                RequestErrorKind::NoResponders => {
                    Error::AgentUnavailable(format!("agent {} did not answer {}", self.name, op))
                }
                _ => Error::Transport(format!("Failed to send {} request: {}", op, e)),
            })?;
        protocol::decode::<Reply<Resp>>(&message.payload)?.into_result()
    }
}

#[async_trait]
impl AgentService for RemoteAgent {
    async fn claim(&self, master: &MasterId) -> Result<bool> {
        let request = MasterRequest {
            master: master.clone(),
        };
        self.call(AgentOp::Claim, &request, self.request_timeout).await
    }

    async fn is_busy(&self) -> Result<bool> {
        self.call(AgentOp::Busy, &Empty {}, self.request_timeout).await
    }

    async fn lease(&self) -> Result<Option<ClaimLease>> {
        self.call(AgentOp::Lease, &Empty {}, self.request_timeout).await
    }

    async fn do_build(&self, master: &MasterId, request: BuildRequest) -> Result<ResultDocument> {
        let call = BuildCall {
            master: master.clone(),
            request,
        };
        self.call(AgentOp::Build, &call, self.build_timeout).await
    }

    async fn retrieve_artifacts(&self, master: &MasterId) -> Result<Vec<Artifact>> {
        let request = MasterRequest {
            master: master.clone(),
        };
        self.call(AgentOp::Artifacts, &request, self.build_timeout)
            .await
            .map_err(|e| match e {
                Error::Timeout(m) | Error::Transport(m) => Error::ArtifactTransfer(m),
                other => other,
            })
    }

    async fn clear_outputs(&self, master: &MasterId) -> Result<()> {
        let request = MasterRequest {
            master: master.clone(),
        };
        self.call(AgentOp::Clear, &request, self.request_timeout).await
    }
}
