//! Cadence Core
//!
//! Core domain types, traits, and error handling for Cadence.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the agents, and the transports.

pub mod agent;
pub mod build;
pub mod encoding;
pub mod error;
pub mod events;
pub mod ids;
pub mod plugin;
pub mod ports;
pub mod time;

pub use error::{Error, Result};
pub use ids::*;
