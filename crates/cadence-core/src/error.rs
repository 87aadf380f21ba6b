//! Error types for Cadence.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    IllegalState(String),

    #[error("Duplicate entries in config file for project name {0}")]
    DuplicateProject(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Plugin not found: {kind} '{tag}'")]
    PluginNotFound { kind: &'static str, tag: String },

    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    // Build errors
    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Source control error: {0}")]
    SourceControl(String),

    #[error("Publisher {publisher} failed: {message}")]
    Publish { publisher: String, message: String },

    #[error("Listener failed: {0}")]
    Listener(String),

    // Agent errors
    #[error("No build capacity: {0}")]
    NoCapacity(String),

    #[error("No registrar reachable")]
    DiscoveryUnavailable,

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Agent not claimed: {0}")]
    AgentNotClaimed(String),

    #[error("Artifact transfer failed: {0}")]
    ArtifactTransfer(String),

    // Infrastructure errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means the build could not find an agent to run on.
    pub fn is_no_capacity(&self) -> bool {
        matches!(
            self,
            Error::NoCapacity(_) | Error::DiscoveryUnavailable | Error::AgentUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
