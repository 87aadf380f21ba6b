//! Shell command builder and bootstrapper.

use async_trait::async_trait;
use cadence_core::build::{BuildContext, BuildProperties, ResultDocument};
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::{Bootstrapper, Builder};
use cadence_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable pointing a build at its output directory.
pub const OUTPUT_DIR_ENV: &str = "CADENCE_OUTPUT_DIR";

const MAX_OUTPUT_LINES: usize = 500;

/// Runs a shell command as the build.
///
/// Every build property is exported as `CADENCE_<NAME>` (upper-cased), so a
/// script sees `CADENCE_LABEL`, `CADENCE_CCTIMESTAMP` and so on.
#[derive(Debug, Clone)]
pub struct ExecBuilder {
    command: String,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ExecBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn from_spec(spec: &PluginSpec) -> Result<Self> {
        Ok(Self {
            command: spec.require_str("command")?,
            working_dir: spec.get_str("working_dir").map(PathBuf::from),
            timeout: spec.get_u64("timeout_secs")?.map(Duration::from_secs),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Builder for ExecBuilder {
    fn name(&self) -> &str {
        "exec"
    }

    async fn build(
        &self,
        properties: &BuildProperties,
        ctx: &BuildContext,
    ) -> Result<ResultDocument> {
        let start = Instant::now();
        let dir = self.working_dir.as_deref().or(ctx.working_dir.as_deref());

        let mut command = shell(&self.command, dir);
        for (key, value) in properties {
            command.env(format!("CADENCE_{}", key.to_uppercase()), value);
        }
        if let Some(output_dir) = &ctx.output_dir {
            tokio::fs::create_dir_all(output_dir).await?;
            command.env(OUTPUT_DIR_ENV, output_dir);
        }

        info!(command = %self.command, "Running build command");
        let output = run(command, self.timeout, &self.command).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                command = %self.command,
                code = ?output.status.code(),
                duration_ms,
                "Build command failed"
            );
            return Err(Error::BuildFailed(format!(
                "command exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        debug!(duration_ms, "Build command completed");
        let mut doc = ResultDocument::success(self.name()).with_duration(duration_ms);
        doc.output = collect_lines(&output);
        Ok(doc)
    }
}

/// Runs a shell command before each modification check.
#[derive(Debug, Clone)]
pub struct ExecBootstrapper {
    command: String,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ExecBootstrapper {
    pub fn from_spec(spec: &PluginSpec) -> Result<Self> {
        Ok(Self {
            command: spec.require_str("command")?,
            working_dir: spec.get_str("working_dir").map(PathBuf::from),
            timeout: spec.get_u64("timeout_secs")?.map(Duration::from_secs),
        })
    }
}

#[async_trait]
impl Bootstrapper for ExecBootstrapper {
    fn name(&self) -> &str {
        "exec"
    }

    async fn bootstrap(&self) -> Result<()> {
        let command = shell(&self.command, self.working_dir.as_deref());
        let output = run(command, self.timeout, &self.command).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::BootstrapFailed(format!(
                "'{}' exited with status {:?}: {}",
                self.command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn shell(cmd: &str, dir: Option<&Path>) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd).kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    command
}

async fn run(mut command: Command, timeout: Option<Duration>, label: &str) -> Result<Output> {
    let fut = command.output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(format!("'{}' after {:?}", label, limit)))?,
        None => fut.await,
    };
    output.map_err(|e| Error::BuildFailed(format!("failed to run '{}': {}", label, e)))
}

fn collect_lines(output: &Output) -> Vec<String> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<String> = stdout.lines().chain(stderr.lines()).map(String::from).collect();
    let skip = lines.len().saturating_sub(MAX_OUTPUT_LINES);
    lines.into_iter().skip(skip).collect()
}
