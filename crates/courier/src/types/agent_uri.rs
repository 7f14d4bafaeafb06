use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::endpoint_uri::{split_scheme, UriError};

/// Stable identity of a distributable agent: `scheme://kind/name`.
///
/// Durability agents use the `courier-durability` scheme, with `store` for the
/// per-store recovery agent and `leader` for dormant-node reassignment.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AgentUri {
    pub scheme: String,
    pub kind: String,
    pub name: String,
}

impl AgentUri {
    pub fn new(
        scheme: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AgentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.kind, self.name)
    }
}

impl FromStr for AgentUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = split_scheme(s)?;
        let Some((kind, name)) = rest.split_once('/') else {
            return Err(UriError {
                value: s.to_string(),
                reason: "expected scheme://kind/name",
            });
        };
        if kind.is_empty() || name.is_empty() {
            return Err(UriError {
                value: s.to_string(),
                reason: "expected scheme://kind/name",
            });
        }
        Ok(Self::new(scheme, kind, name))
    }
}
