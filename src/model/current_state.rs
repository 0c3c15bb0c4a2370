//! Observed replica state as last reported by one participant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::states::State;
use crate::metadata::SessionId;

/// Per-(instance, session, resource) record of actual partition states.
/// Written only by the owning participant's engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentState {
    pub resource: String,
    pub session: SessionId,
    pub state_model_def: String,
    /// partition -> last recorded state
    pub partitions: BTreeMap<String, State>,
}

impl CurrentState {
    pub fn new(
        resource: impl Into<String>,
        session: SessionId,
        state_model_def: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            session,
            state_model_def: state_model_def.into(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn state_of(&self, partition: &str) -> Option<&State> {
        self.partitions.get(partition)
    }

    pub fn set(&mut self, partition: impl Into<String>, state: State) {
        self.partitions.insert(partition.into(), state);
    }
}
