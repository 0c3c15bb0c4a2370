//! Third stage: intersect the ideal state with cluster liveness.
//!
//! The placement contract here is intentionally plain: desired states come
//! from the ideal state record, restricted to instances that are live and
//! enabled. Richer rebalancing strategies plug in by rewriting ideal states
//! through the admin surface.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::controller::cluster_data::ClusterDataCache;
use crate::controller::event::{attributes, ClusterEvent};
use crate::controller::stage::{Stage, StageContext, StageError, StageResult};
use crate::model::State;

#[derive(Debug, Clone, Default)]
pub struct BestPossibleStateOutput {
    /// resource -> partition -> instance -> desired state
    pub states: HashMap<String, HashMap<String, HashMap<String, State>>>,
}

impl BestPossibleStateOutput {
    pub fn desired_state(&self, resource: &str, partition: &str, instance: &str) -> Option<&State> {
        self.states.get(resource)?.get(partition)?.get(instance)
    }
}

#[derive(Default)]
pub struct BestPossibleStateStage;

impl BestPossibleStateStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for BestPossibleStateStage {
    fn name(&self) -> &'static str {
        "BestPossibleStateCompute"
    }

    async fn init(&mut self, _context: StageContext) {}

    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()> {
        let cache = event
            .attribute::<ClusterDataCache>(attributes::CLUSTER_DATA)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::CLUSTER_DATA,
            })?;

        let mut output = BestPossibleStateOutput::default();
        for (resource, ideal) in &cache.ideal_states {
            for (partition, assignment) in &ideal.partitions {
                for (instance, desired) in assignment {
                    if !cache.is_assignable(instance) {
                        continue;
                    }
                    output
                        .states
                        .entry(resource.clone())
                        .or_default()
                        .entry(partition.clone())
                        .or_default()
                        .insert(instance.clone(), desired.clone());
                }
            }
        }

        event.set_attribute(attributes::BEST_POSSIBLE, output);
        Ok(())
    }
}
