//! Command handlers.

use anyhow::Context;
use cadence_agent::{AgentConfig, AnnounceService, BuildAgentService};
use cadence_core::ports::RegistrarLocator;
use cadence_nats::{AgentEndpoint, NatsConfig, NatsLocator};
use cadence_plugins::PluginRegistry;
use cadence_scheduler::config::DiscoveryConfig;
use cadence_scheduler::snapshot::ProjectSnapshot;
use cadence_scheduler::{Controller, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Snapshots live here unless configured otherwise.
pub fn default_state_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "cadence", "cadence")
        .map(|dirs| dirs.data_dir().join("state"))
}

fn load_server_config(path: &Path) -> anyhow::Result<ServerConfig> {
    ServerConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Connection settings for one discovery locator.
pub fn nats_config(discovery: &DiscoveryConfig, url: &str) -> NatsConfig {
    NatsConfig::new(url)
        .with_request_timeout(Duration::from_secs(discovery.request_timeout_secs))
        .with_build_timeout(Duration::from_secs(discovery.build_timeout_secs))
        .with_lookup_window(Duration::from_millis(discovery.lookup_window_ms))
}

pub async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let mut server = load_server_config(config_path)?;
    if server.state_dir.is_none() {
        server.state_dir = default_state_dir();
    }

    let locators: Vec<Arc<dyn RegistrarLocator>> = server
        .discovery
        .locators
        .iter()
        .map(|url| {
            Arc::new(NatsLocator::new(nats_config(&server.discovery, url)))
                as Arc<dyn RegistrarLocator>
        })
        .collect();

    let controller = Controller::new(server, PluginRegistry::builtin(), locators)?;
    controller.start().await?;
    info!(
        projects = controller.project_names().await.len(),
        "Cadence server started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    controller.shutdown().await;
    Ok(())
}

pub async fn agent(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load agent configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config.validate()?;

    let agent = Arc::new(BuildAgentService::from_config(
        &config,
        PluginRegistry::builtin(),
    ));
    let registrar = Arc::new(config.local_registrar());
    let client = NatsConfig::new(&config.nats_url).connect().await?;
    let endpoint =
        AgentEndpoint::new(client, Arc::clone(&agent)).with_registrar(Arc::clone(&registrar));
    let announce = AnnounceService::new(
        Arc::clone(&agent),
        registrar,
        config.announce_interval_secs,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let announce_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { announce.run(shutdown).await })
    };
    let endpoint_task = tokio::spawn(async move { endpoint.run(shutdown_rx).await });
    info!(
        agent = %agent.name(),
        agent_id = %agent.agent_id(),
        nats_url = %config.nats_url,
        lease_secs = config.lease_secs,
        "Build agent started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown_tx.send_replace(true);
    announce_task.await?;
    endpoint_task.await??;
    Ok(())
}

pub fn validate(config_path: &Path) -> anyhow::Result<()> {
    let server = load_server_config(config_path)?;
    server.validate(&PluginRegistry::builtin())?;
    println!(
        "{}: {} project(s) OK",
        config_path.display(),
        server.projects.len()
    );
    for project in &server.projects {
        println!("  {}", project.name);
    }
    Ok(())
}

pub async fn status(state_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = state_dir
        .or_else(default_state_dir)
        .context("Could not determine state directory")?;
    let snapshots = ProjectSnapshot::load_all(&dir).await?;
    if snapshots.is_empty() {
        println!("No projects recorded in {}", dir.display());
        return Ok(());
    }
    print!("{}", format_status(&snapshots));
    Ok(())
}

pub fn format_status(snapshots: &[ProjectSnapshot]) -> String {
    let width = snapshots
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0)
        .max("PROJECT".len());

    let mut out = format!(
        "{:<width$}  {:<12}  {:<19}  {:<7}  {}\n",
        "PROJECT", "LABEL", "LAST BUILD", "RESULT", "FLAGS"
    );
    for s in snapshots {
        let result = if s.last_build_successful { "passed" } else { "failed" };
        let mut flags = Vec::new();
        if s.paused {
            flags.push("paused");
        }
        if s.build_forced {
            flags.push("forced");
        }
        out.push_str(&format!(
            "{:<width$}  {:<12}  {:<19}  {:<7}  {}\n",
            s.name,
            s.label,
            s.last_build.format("%Y-%m-%d %H:%M:%S").to_string(),
            result,
            flags.join(",")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::time::parse_timestamp;
    use cadence_scheduler::snapshot::SNAPSHOT_VERSION;

    #[test]
    fn test_format_status() {
        let at = parse_timestamp("20011122120000").unwrap();
        let snapshots = vec![
            ProjectSnapshot {
                version: SNAPSHOT_VERSION,
                name: "core".into(),
                label: "build.4".into(),
                last_build: at,
                last_successful_build: at,
                last_build_successful: true,
                build_counter: 4,
                paused: false,
                build_forced: false,
            },
            ProjectSnapshot {
                version: SNAPSHOT_VERSION,
                name: "web-frontend".into(),
                label: "1.2.3".into(),
                last_build: at,
                last_successful_build: at,
                last_build_successful: false,
                build_counter: 9,
                paused: true,
                build_forced: true,
            },
        ];

        let table = format_status(&snapshots);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("PROJECT       LABEL"));
        assert!(lines[1].contains("build.4") && lines[1].contains("passed"));
        assert!(lines[2].contains("2001-11-22 12:00:00"));
        assert!(lines[2].ends_with("failed   paused,forced"));
    }

    #[test]
    fn test_nats_config_from_discovery() {
        let server = ServerConfig::from_yaml(
            "discovery:\n  locators: [\"nats://a:4222\"]\n  lookup_window_ms: 250\n",
        )
        .unwrap();
        let config = nats_config(&server.discovery, "nats://a:4222");
        assert_eq!(config.urls, vec!["nats://a:4222"]);
        assert_eq!(config.lookup_window, Duration::from_millis(250));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.build_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_reports_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.yaml");
        std::fs::write(
            &path,
            "projects:\n  - name: a\n    schedule: { builds: [ { builder: { type: exec, command: \"true\" } } ] }\n  - name: a\n    schedule: { builds: [ { builder: { type: exec, command: \"true\" } } ] }\n",
        )
        .unwrap();
        let err = validate(&path).unwrap_err();
        assert!(
            format!("{:#}", err).contains("Duplicate entries in config file for project name a")
        );
    }
}
