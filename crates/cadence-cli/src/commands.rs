//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build server
    Serve {
        /// Path to server configuration
        #[arg(short, long, default_value = "cadence.yaml")]
        config: PathBuf,
    },

    /// Run a build agent
    Agent {
        /// Path to agent configuration; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate server configuration without starting anything
    Validate {
        /// Path to server configuration
        #[arg(short, long, default_value = "cadence.yaml")]
        config: PathBuf,
    },

    /// Show persisted project state
    Status {
        /// Directory holding project snapshots
        #[arg(short, long)]
        state_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
