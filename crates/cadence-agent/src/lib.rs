//! Build agent for Cadence.

pub mod announce;
pub mod config;
pub mod registrar;
pub mod service;

pub use announce::AnnounceService;
pub use config::AgentConfig;
pub use registrar::{FixedLocator, LocalRegistrar};
pub use service::BuildAgentService;
