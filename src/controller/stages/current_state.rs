//! Second stage: project reported current states and in-flight messages
//! into per-resource maps the placement stages consume.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::controller::cluster_data::ClusterDataCache;
use crate::controller::event::{attributes, ClusterEvent};
use crate::controller::stage::{Stage, StageContext, StageError, StageResult};
use crate::model::State;

/// resource -> partition -> instance -> state
type StateMap = HashMap<String, HashMap<String, HashMap<String, State>>>;

#[derive(Debug, Clone, Default)]
pub struct CurrentStateOutput {
    /// Last state each live instance reported per replica.
    pub current: StateMap,
    /// Target states of messages still pending, so the message generator
    /// does not double-send while a transition is in flight.
    pub pending: StateMap,
}

impl CurrentStateOutput {
    pub fn current_state(&self, resource: &str, partition: &str, instance: &str) -> Option<&State> {
        self.current.get(resource)?.get(partition)?.get(instance)
    }

    pub fn pending_state(&self, resource: &str, partition: &str, instance: &str) -> Option<&State> {
        self.pending.get(resource)?.get(partition)?.get(instance)
    }
}

#[derive(Default)]
pub struct CurrentStateStage;

impl CurrentStateStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for CurrentStateStage {
    fn name(&self) -> &'static str {
        "CurrentStateCompute"
    }

    async fn init(&mut self, _context: StageContext) {}

    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()> {
        let cache = event
            .attribute::<ClusterDataCache>(attributes::CLUSTER_DATA)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::CLUSTER_DATA,
            })?;

        let mut output = CurrentStateOutput::default();
        for (instance, per_resource) in &cache.current_states {
            for (resource, current) in per_resource {
                for (partition, state) in &current.partitions {
                    output
                        .current
                        .entry(resource.clone())
                        .or_default()
                        .entry(partition.clone())
                        .or_default()
                        .insert(instance.clone(), state.clone());
                }
            }
        }

        for (instance, messages) in &cache.messages {
            let Some(live) = cache.live_instances.get(instance) else {
                continue;
            };
            for message in messages {
                if !message.is_pending() || message.target_session != live.session {
                    continue;
                }
                output
                    .pending
                    .entry(message.resource.clone())
                    .or_default()
                    .entry(message.partition.clone())
                    .or_default()
                    .insert(instance.clone(), message.to_state.clone());
            }
        }

        event.set_attribute(attributes::CURRENT_STATES, output);
        Ok(())
    }
}
