//! Where a command runs: the controlling host or a named distribution.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Execution target for a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TargetEnvironment {
    /// The Windows host that runs `wsl.exe`.
    Host,
    /// A named guest distribution.
    Distribution(String),
}

impl TargetEnvironment {
    /// Target a distribution, rejecting an empty name.
    pub fn distribution(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::spec("distribution name must not be empty"));
        }
        Ok(Self::Distribution(name))
    }

    /// Distribution name, if this targets one.
    pub fn distribution_name(&self) -> Option<&str> {
        match self {
            Self::Host => None,
            Self::Distribution(name) => Some(name),
        }
    }

    /// Whether this is the host.
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl fmt::Display for TargetEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Distribution(name) => write!(f, "distribution '{name}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_distribution_rejected() {
        assert!(TargetEnvironment::distribution("").is_err());
        assert!(TargetEnvironment::distribution("  ").is_err());
        let target = TargetEnvironment::distribution("Ubuntu").unwrap();
        assert_eq!(target.distribution_name(), Some("Ubuntu"));
        assert!(!target.is_host());
    }

    #[test]
    fn test_display() {
        assert_eq!(TargetEnvironment::Host.to_string(), "host");
        assert_eq!(
            TargetEnvironment::Distribution("Debian".into()).to_string(),
            "distribution 'Debian'"
        );
    }
}
