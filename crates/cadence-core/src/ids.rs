//! Strongly-typed identifiers for domain entities.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generates a uuid v7 newtype rendered as `<prefix>_<uuid>`, so ids sort
/// by creation time.
macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .and_then(|raw| Uuid::try_parse(raw).ok())
                    .map(Self)
                    .ok_or_else(|| Error::Configuration(format!("malformed {} id '{}'", Self::PREFIX, s)))
            }
        }
    };
}

prefixed_id!(
    /// A build agent, stable for the life of the agent process.
    AgentId => "agt"
);
prefixed_id!(
    /// One execution of a build, local or remote.
    BuildId => "bld"
);

/// Identity of a master (the process driving builds). Holders of claims are
/// named by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterId(String);

impl MasterId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A master id unique to this process: `<host>-<uuid>`.
    pub fn generate(host: &str) -> Self {
        Self(format!("{}-{}", host, Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
