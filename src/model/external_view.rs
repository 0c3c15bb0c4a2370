//! Aggregated externally-visible state for one resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::states::State;

/// Snapshot of current states across all participants, computed by the
/// controller pipeline for spectators and admin tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalView {
    pub resource: String,
    /// partition -> instance -> observed state
    pub partitions: BTreeMap<String, BTreeMap<String, State>>,
}

impl ExternalView {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, partition: impl Into<String>, instance: impl Into<String>, state: State) {
        self.partitions
            .entry(partition.into())
            .or_default()
            .insert(instance.into(), state);
    }

    pub fn state_of(&self, partition: &str, instance: &str) -> Option<&State> {
        self.partitions.get(partition).and_then(|m| m.get(instance))
    }
}
