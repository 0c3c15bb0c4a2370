//! Replica states and partition identity.
//!
//! States are string-typed so applications can register arbitrary state
//! models; the built-in OnlineOffline names live in [`crate::constants`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::states;

/// One state of a state model, e.g. `ONLINE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn online() -> Self {
        Self::new(states::ONLINE)
    }

    pub fn offline() -> Self {
        Self::new(states::OFFLINE)
    }

    pub fn dropped() -> Self {
        Self::new(states::DROPPED)
    }

    /// The state the engine moves a replica to when a handler fails.
    pub fn error() -> Self {
        Self::new(states::ERROR)
    }

    pub fn is_error(&self) -> bool {
        self.0 == states::ERROR
    }
}

impl From<&str> for State {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one partition replica slot: the unit of state assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub resource: String,
    pub partition: String,
}

impl PartitionKey {
    pub fn new(resource: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            partition: partition.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_is_transparent() {
        let state = State::online();
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"ONLINE\"");
        let parsed: State = serde_json::from_str("\"OFFLINE\"").unwrap();
        assert_eq!(parsed, State::offline());
    }

    #[test]
    fn test_error_state() {
        assert!(State::error().is_error());
        assert!(!State::online().is_error());
    }
}
