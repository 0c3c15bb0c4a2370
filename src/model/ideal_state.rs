//! Desired partition placement for one resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::states::State;

/// The desired partition-to-instance-state assignment for a resource,
/// seeded by the admin surface and read by the controller pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdealState {
    pub resource: String,
    pub state_model_def: String,
    pub replicas: u32,
    /// partition -> instance -> desired state
    pub partitions: BTreeMap<String, BTreeMap<String, State>>,
}

impl IdealState {
    pub fn new(resource: impl Into<String>, state_model_def: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state_model_def: state_model_def.into(),
            replicas: 1,
            partitions: BTreeMap::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Assign a desired state for one replica slot.
    pub fn assign(
        mut self,
        partition: impl Into<String>,
        instance: impl Into<String>,
        state: State,
    ) -> Self {
        self.partitions
            .entry(partition.into())
            .or_default()
            .insert(instance.into(), state);
        self
    }

    pub fn desired_state(&self, partition: &str, instance: &str) -> Option<&State> {
        self.partitions.get(partition).and_then(|m| m.get(instance))
    }

    pub fn partition_names(&self) -> impl Iterator<Item = &String> {
        self.partitions.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment() {
        let ideal = IdealState::new("db", "OnlineOffline")
            .assign("db_0", "node-1", State::online())
            .assign("db_0", "node-2", State::online())
            .assign("db_1", "node-1", State::online());

        assert_eq!(
            ideal.desired_state("db_0", "node-2"),
            Some(&State::online())
        );
        assert_eq!(ideal.desired_state("db_1", "node-2"), None);
        assert_eq!(ideal.partition_names().count(), 2);
    }
}
