//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! collaborators it drives: builders, source control, publishers, listeners,
//! and remote agents reached through discovery.

use crate::agent::{AgentFilter, Advertisement, ClaimLease};
use crate::build::{
    Artifact, BuildContext, BuildLog, BuildProperties, BuildRequest, Modification, ResultDocument,
};
use crate::events::ProjectEvent;
use crate::ids::MasterId;
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::fmt;
use std::sync::Arc;

/// Runs a build and produces its result document.
#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with [`crate::Error::BuildFailed`] on non-zero exit or I/O failure.
    async fn build(&self, properties: &BuildProperties, ctx: &BuildContext)
    -> Result<ResultDocument>;
}

/// Reports changes in a source repository.
#[async_trait]
pub trait SourceControl: Send + Sync {
    fn name(&self) -> &str;

    /// Changes with timestamps in `[since, now]`.
    async fn get_modifications(
        &self,
        since: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Vec<Modification>>;

    /// Side-channel flags from the last check, e.g. `filemodified`.
    fn properties(&self) -> BuildProperties {
        BuildProperties::new()
    }
}

/// Runs before the modification check, e.g. to refresh a working copy.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    fn name(&self) -> &str;

    async fn bootstrap(&self) -> Result<()>;
}

/// Receives the merged build log after every build.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, log: &BuildLog) -> Result<()>;
}

/// Computes the next build label.
pub trait LabelIncrementer: Send + Sync {
    fn increment(&self, label: &str) -> String;

    fn is_valid_label(&self, label: &str) -> bool;

    fn default_label(&self) -> String;
}

/// Observes project lifecycle events.
#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str {
        "listener"
    }

    async fn project_added(&self, _project: &str) -> Result<()> {
        Ok(())
    }

    async fn project_removed(&self, _project: &str) -> Result<()> {
        Ok(())
    }

    async fn handle_event(&self, event: &ProjectEvent) -> Result<()>;
}

/// A build agent as seen by a master. `claim` is atomic on the agent side.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Check-and-set of the busy flag. `Ok(false)` means somebody else holds it.
    async fn claim(&self, master: &MasterId) -> Result<bool>;

    async fn is_busy(&self) -> Result<bool>;

    async fn lease(&self) -> Result<Option<ClaimLease>>;

    /// Run a build on the claimed agent; the agent stays busy afterwards.
    /// Every call after `claim` names the holder and fails with
    /// `AgentNotClaimed` for anyone else.
    async fn do_build(&self, master: &MasterId, request: BuildRequest) -> Result<ResultDocument>;

    async fn retrieve_artifacts(&self, master: &MasterId) -> Result<Vec<Artifact>>;

    /// Discard held outputs and return the agent to the available pool. A
    /// release asked for mid-build takes effect when that build finishes.
    async fn clear_outputs(&self, master: &MasterId) -> Result<()>;
}

/// One agent visible through a registrar.
#[derive(Clone)]
pub struct AgentEntry {
    pub advertisement: Advertisement,
    pub service: Arc<dyn AgentService>,
}

impl fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEntry")
            .field("advertisement", &self.advertisement)
            .finish_non_exhaustive()
    }
}

/// A discovery service agents advertise through.
#[async_trait]
pub trait Registrar: Send + Sync {
    fn locator(&self) -> &str;

    /// Whether the registrar still answers.
    async fn is_alive(&self) -> bool {
        true
    }

    /// Build agents whose advertised attributes satisfy `filter`.
    async fn lookup(&self, filter: &AgentFilter) -> Result<Vec<AgentEntry>>;
}

/// Finds a registrar at a fixed location.
#[async_trait]
pub trait RegistrarLocator: Send + Sync {
    fn url(&self) -> &str;

    async fn locate(&self) -> Result<Arc<dyn Registrar>>;
}
