//! The three cooperating roles of a deployment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One side of an agent.
///
/// The lower-case name is used verbatim as a queue-name segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Public-facing side: accepts requests, publishes tasks, serves lookups.
    Facade,
    /// Worker side: executes actions and reports progress and results.
    Worker,
    /// Persistence side: stores progress and results, answers lookups.
    Persistence,
}

impl Role {
    /// All roles, in declaration order.
    pub const ALL: [Role; 3] = [Role::Facade, Role::Worker, Role::Persistence];

    /// Queue-name segment for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Facade => "facade",
            Self::Worker => "worker",
            Self::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "facade" => Ok(Self::Facade),
            "worker" => Ok(Self::Worker),
            "persistence" => Ok(Self::Persistence),
            other => Err(Error::configuration(format!("unknown role '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matches_display() {
        for role in Role::ALL {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("brain".parse::<Role>().is_err());
    }
}
