//! Project scheduling, build queue and agent pool for Cadence.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod events;
pub mod modifications;
pub mod pool;
pub mod project;
pub mod queue;
pub mod resultlog;
pub mod schedule;
pub mod snapshot;

pub use config::{ProjectConfig, ServerConfig};
pub use controller::Controller;
pub use dispatcher::BuildDispatcher;
pub use pool::{AgentPool, Discovery, SelectionPolicy};
pub use project::{Project, ProjectSetup};
pub use queue::BuildQueue;
