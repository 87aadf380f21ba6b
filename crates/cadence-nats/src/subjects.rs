//! Subject naming.
//!
//! Lookups are scatter-gather on [`DISCOVERY_LOOKUP`]; every agent answers
//! with its advertisement. Claim protocol calls are request/reply on
//! `cadence.agent.<agent_id>.<op>`.

use cadence_core::ids::AgentId;
use std::fmt;

pub const DISCOVERY_LOOKUP: &str = "cadence.discovery.lookup";

const AGENT_PREFIX: &str = "cadence.agent";

/// Operations of the claim protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOp {
    Claim,
    Busy,
    Lease,
    Build,
    Artifacts,
    Clear,
}

impl AgentOp {
    pub const ALL: [AgentOp; 6] = [
        AgentOp::Claim,
        AgentOp::Busy,
        AgentOp::Lease,
        AgentOp::Build,
        AgentOp::Artifacts,
        AgentOp::Clear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentOp::Claim => "claim",
            AgentOp::Busy => "busy",
            AgentOp::Lease => "lease",
            AgentOp::Build => "build",
            AgentOp::Artifacts => "artifacts",
            AgentOp::Clear => "clear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for AgentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn agent_subject(agent_id: &AgentId, op: AgentOp) -> String {
    format!("{}.{}.{}", AGENT_PREFIX, agent_id, op)
}

/// Wildcard covering every operation of one agent.
pub fn agent_wildcard(agent_id: &AgentId) -> String {
    format!("{}.{}.*", AGENT_PREFIX, agent_id)
}

/// The operation addressed by a per-agent subject.
pub fn parse_op(subject: &str) -> Option<AgentOp> {
    let rest = subject.strip_prefix(AGENT_PREFIX)?.strip_prefix('.')?;
    let (_, op) = rest.rsplit_once('.')?;
    AgentOp::parse(op)
}
