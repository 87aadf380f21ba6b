//! NATS transport for Cadence: agent discovery and the claim protocol.

pub mod config;
mod endpoint;
pub mod protocol;
mod registrar;
pub mod subjects;

pub use config::NatsConfig;
pub use endpoint::AgentEndpoint;
pub use registrar::{NatsLocator, NatsRegistrar, RemoteAgent};
