//! Built-in plugins for Cadence and the registry that instantiates them.

pub mod exec;
pub mod labels;
pub mod log;
pub mod registry;
pub mod socket;
pub mod sources;
pub mod webhook;

pub use exec::{ExecBootstrapper, ExecBuilder};
pub use labels::DefaultLabelIncrementer;
pub use registry::PluginRegistry;
