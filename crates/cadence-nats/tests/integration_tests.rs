//! Integration tests for cadence-nats.
//!
//! These tests start a NATS server in a container.
//! Run with: `cargo test -p cadence-nats --features integration`

#![cfg(feature = "integration")]

use cadence_agent::{AnnounceService, BuildAgentService, LocalRegistrar};
use cadence_core::Error;
use cadence_core::agent::{AgentFilter, Attributes};
use cadence_core::build::{BuildProperties, BuildRequest};
use cadence_core::ids::{BuildId, MasterId};
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::{AgentService, RegistrarLocator};
use cadence_nats::{AgentEndpoint, NatsConfig, NatsLocator};
use cadence_plugins::PluginRegistry;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;
use tokio::sync::watch;
use tokio_test::assert_ok;

struct NatsServer {
    #[allow(dead_code)] // Kept to maintain container lifetime
    container: ContainerAsync<Nats>,
    url: String,
}

impl NatsServer {
    async fn start() -> NatsServer {
        let container = Nats::default()
            .with_tag("2.10-alpine")
            .start()
            .await
            .expect("start nats");
        let host = container.get_host().await.expect("host");
        let port = container.get_host_port_ipv4(4222).await.expect("port");
        let url = format!("nats://{}:{}", host, port);
        NatsServer { container, url }
    }

    fn config(&self) -> NatsConfig {
        NatsConfig::new(&self.url).with_lookup_window(Duration::from_millis(300))
    }
}

struct RunningAgent {
    agent: Arc<BuildAgentService>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    _workspace: tempfile::TempDir,
}

impl RunningAgent {
    async fn start(server: &NatsServer, name: &str, os: &str) -> RunningAgent {
        let workspace = tempfile::tempdir().unwrap();
        let mut attributes = Attributes::new();
        attributes.insert("os".into(), os.into());
        let agent = Arc::new(BuildAgentService::new(
            name,
            attributes,
            PluginRegistry::builtin(),
            workspace.path(),
        ));
        let client = server.config().connect().await.expect("connect");
        let endpoint = AgentEndpoint::new(client.clone(), Arc::clone(&agent));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            endpoint.run(shutdown_rx).await.expect("endpoint");
        });
        // Let the subscriptions reach the server.
        client.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(100)).await;

        RunningAgent {
            agent,
            shutdown,
            task,
            _workspace: workspace,
        }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        self.task.await.unwrap();
    }
}

fn request(command: &str) -> BuildRequest {
    BuildRequest {
        build_id: BuildId::new(),
        project: "proj".into(),
        module: Some("core".into()),
        builder: PluginSpec::new("exec").with_param("command", command),
        properties: BuildProperties::new(),
    }
}

#[tokio::test]
async fn test_lookup_filters_advertisements() {
    let server = NatsServer::start().await;
    let linux = RunningAgent::start(&server, "linux-1", "linux").await;
    let windows = RunningAgent::start(&server, "windows-1", "windows").await;

    let locator = NatsLocator::new(server.config());
    let registrar = assert_ok!(locator.locate().await);
    assert!(registrar.is_alive().await);

    let all = assert_ok!(registrar.lookup(&AgentFilter::any()).await);
    let names: Vec<_> = all.iter().map(|e| e.advertisement.name.as_str()).collect();
    assert_eq!(names, vec!["linux-1", "windows-1"]);

    let only_linux = assert_ok!(registrar.lookup(&AgentFilter::any().with("os", "linux")).await);
    assert_eq!(only_linux.len(), 1);
    assert_eq!(only_linux[0].advertisement.agent_id, linux.agent.agent_id());

    linux.stop().await;
    windows.stop().await;
}

#[tokio::test]
async fn test_claim_build_and_clear_over_nats() {
    let server = NatsServer::start().await;
    let running = RunningAgent::start(&server, "agent-1", "linux").await;

    let locator = NatsLocator::new(server.config());
    let registrar = assert_ok!(locator.locate().await);
    let entries = assert_ok!(registrar.lookup(&AgentFilter::any()).await);
    let remote = Arc::clone(&entries[0].service);

    let master = MasterId::new("m1");
    assert!(assert_ok!(remote.claim(&master).await));
    assert!(!assert_ok!(remote.claim(&MasterId::new("m2")).await));
    let lease = assert_ok!(remote.lease().await).expect("lease");
    assert_eq!(lease.holder, MasterId::new("m1"));

    let result = assert_ok!(
        remote
            .do_build(&master, request("echo \"$CADENCE_MODULE\" > \"$CADENCE_OUTPUT_DIR/module.txt\""))
            .await
    );
    assert!(result.success);
    assert_eq!(result.agent.as_deref(), Some("agent-1"));
    assert!(assert_ok!(remote.is_busy().await));

    let artifacts = assert_ok!(remote.retrieve_artifacts(&master).await);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "module.txt");
    assert_eq!(artifacts[0].bytes, b"core\n");

    let err = remote.clear_outputs(&MasterId::new("m2")).await.unwrap_err();
    assert!(matches!(err, Error::AgentNotClaimed(_)));
    assert!(assert_ok!(remote.is_busy().await));

    assert_ok!(remote.clear_outputs(&master).await);
    assert!(!assert_ok!(remote.is_busy().await));

    running.stop().await;
}

#[tokio::test]
async fn test_protocol_errors_cross_the_wire() {
    let server = NatsServer::start().await;
    let running = RunningAgent::start(&server, "agent-1", "linux").await;

    let registrar = assert_ok!(NatsLocator::new(server.config()).locate().await);
    let entries = assert_ok!(registrar.lookup(&AgentFilter::any()).await);
    let remote = Arc::clone(&entries[0].service);

    let err = remote
        .do_build(&MasterId::new("m1"), request("true"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentNotClaimed(_)));

    running.stop().await;

    // The endpoint is gone: nobody answers.
    let err = remote.is_busy().await.unwrap_err();
    assert!(matches!(err, Error::AgentUnavailable(_) | Error::Timeout(_)));
}

#[tokio::test]
async fn test_agent_is_discoverable_only_while_announcing() {
    let server = NatsServer::start().await;
    let workspace = tempfile::tempdir().unwrap();
    let agent = Arc::new(BuildAgentService::new(
        "announced-1",
        Attributes::new(),
        PluginRegistry::builtin(),
        workspace.path(),
    ));
    let registrar = Arc::new(LocalRegistrar::new("local://announced-1", Duration::from_secs(5)));
    let client = server.config().connect().await.expect("connect");
    let endpoint =
        AgentEndpoint::new(client.clone(), Arc::clone(&agent)).with_registrar(Arc::clone(&registrar));
    let announce = AnnounceService::new(Arc::clone(&agent), Arc::clone(&registrar), 1);

    let (endpoint_stop, endpoint_rx) = watch::channel(false);
    let (announce_stop, announce_rx) = watch::channel(false);
    let endpoint_task = tokio::spawn(async move { endpoint.run(endpoint_rx).await });
    let announce_task = tokio::spawn(async move { announce.run(announce_rx).await });
    client.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let nats = assert_ok!(NatsLocator::new(server.config()).locate().await);
    assert_eq!(assert_ok!(nats.lookup(&AgentFilter::any()).await).len(), 1);

    announce_stop.send_replace(true);
    announce_task.await.unwrap();
    assert!(!registrar.is_registered(&agent.agent_id()));
    assert!(assert_ok!(nats.lookup(&AgentFilter::any()).await).is_empty());

    endpoint_stop.send_replace(true);
    assert_ok!(endpoint_task.await.unwrap());
}

#[tokio::test]
async fn test_unreachable_server_fails_to_locate() {
    let mut config = NatsConfig::new("nats://127.0.0.1:1");
    config.connection_timeout = Duration::from_millis(200);
    let locator = NatsLocator::new(config);
    assert!(locator.locate().await.is_err());
}
