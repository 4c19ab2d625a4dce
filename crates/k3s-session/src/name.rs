use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const NAME_MAX_LENGTH: usize = 63;

lazy_static! {
    static ref NAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap();
}

/// The identity of a cluster. Every cache volume of the cluster is keyed by it,
/// so two clusters with different names never share state on one engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterName(String);

impl ClusterName {
    /// Validates `name`: 1 to 63 characters, ASCII letters, digits, `.`, `_`
    /// or `-`, starting with a letter or digit.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.len() > NAME_MAX_LENGTH {
            Some("must be at most 63 characters")
        } else if !NAME_REGEX.is_match(&name) {
            Some("may only contain ASCII letters, digits, '.', '_' and '-' and must start with a letter or digit")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(Error::InvalidName { name, reason }),
            None => Ok(ClusterName(name)),
        }
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClusterName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClusterName::new(s)
    }
}

impl std::convert::TryFrom<String> for ClusterName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ClusterName::new(s)
    }
}

impl From<ClusterName> for String {
    fn from(name: ClusterName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        for name in &["demo", "ci-42", "team_a.dev", "K3S"] {
            assert_eq!(ClusterName::new(*name).expect("valid").as_str(), *name);
        }
    }

    #[test]
    fn rejects_bad_names() {
        let too_long = "a".repeat(64);
        for name in &["", "-demo", "has space", "slash/name", "semi;colon", too_long.as_str()] {
            assert!(
                matches!(ClusterName::new(*name), Err(Error::InvalidName { .. })),
                "{:?} should be rejected",
                name
            );
        }
    }
}
