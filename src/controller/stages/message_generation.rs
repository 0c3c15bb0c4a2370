//! Fourth stage: diff desired against current state and emit transition
//! messages, one legal edge at a time.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::controller::cluster_data::ClusterDataCache;
use crate::controller::event::{attributes, ClusterEvent};
use crate::controller::stage::{Stage, StageContext, StageError, StageResult};
use crate::controller::stages::best_possible_state::BestPossibleStateOutput;
use crate::controller::stages::current_state::CurrentStateOutput;
use crate::model::Message;

/// A queued message that can no longer be delivered: its target session is
/// gone or its timeout elapsed. The dispatch stage deletes these so the
/// replica can be re-driven from current state.
#[derive(Debug, Clone)]
pub struct StaleMessage {
    pub instance: String,
    pub id: Uuid,
}

pub struct MessageGenerationStage {
    context: Option<StageContext>,
}

impl Default for MessageGenerationStage {
    fn default() -> Self {
        Self { context: None }
    }
}

impl MessageGenerationStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for MessageGenerationStage {
    fn name(&self) -> &'static str {
        "MessageGeneration"
    }

    async fn init(&mut self, context: StageContext) {
        self.context = Some(context);
    }

    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()> {
        let context = self.context.as_ref().ok_or(StageError::NotInitialized {
            stage: self.name(),
        })?;
        let cache = event
            .attribute::<ClusterDataCache>(attributes::CLUSTER_DATA)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::CLUSTER_DATA,
            })?;
        let current = event
            .attribute::<CurrentStateOutput>(attributes::CURRENT_STATES)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::CURRENT_STATES,
            })?;
        let best = event
            .attribute::<BestPossibleStateOutput>(attributes::BEST_POSSIBLE)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::BEST_POSSIBLE,
            })?;

        let now = Utc::now();
        let mut stale = Vec::new();
        for (instance, messages) in &cache.messages {
            let live_session = cache.live_instances.get(instance).map(|l| l.session);
            for message in messages {
                let session_gone = live_session != Some(message.target_session);
                if session_gone || message.is_expired(now) {
                    stale.push(StaleMessage {
                        instance: instance.clone(),
                        id: message.id,
                    });
                }
            }
        }

        let mut generated = Vec::new();
        for (resource, partitions) in &best.states {
            let Some(ideal) = cache.ideal_states.get(resource) else {
                continue;
            };
            let Some(def) = context.state_model_defs.get(&ideal.state_model_def) else {
                warn!(
                    resource = %resource,
                    state_model = %ideal.state_model_def,
                    "no state model definition registered, skipping resource"
                );
                continue;
            };
            for (partition, assignment) in partitions {
                for (instance, desired) in assignment {
                    let Some(live) = cache.live_instances.get(instance) else {
                        continue;
                    };
                    let from = current
                        .current_state(resource, partition, instance)
                        .cloned()
                        .unwrap_or_else(|| def.initial_state().clone());
                    if &from == desired {
                        continue;
                    }
                    // A transition is already in flight for this replica;
                    // wait for its result before deciding the next hop.
                    if current.pending_state(resource, partition, instance).is_some() {
                        debug!(
                            resource = %resource,
                            partition = %partition,
                            instance = %instance,
                            "transition pending, not generating another message"
                        );
                        continue;
                    }
                    let Some(next) = def.next_state_on_path(&from, desired) else {
                        warn!(
                            resource = %resource,
                            partition = %partition,
                            instance = %instance,
                            from = %from,
                            to = %desired,
                            "desired state unreachable from current state"
                        );
                        continue;
                    };
                    let message = Message::transition(
                        instance.clone(),
                        live.session,
                        resource.clone(),
                        partition.clone(),
                        from,
                        next,
                        ideal.state_model_def.clone(),
                    )
                    .with_timeout_ms(context.config.messaging.default_timeout_ms);
                    generated.push(message);
                }
            }
        }

        debug!(
            generated = generated.len(),
            stale = stale.len(),
            "message generation complete"
        );
        event.set_attribute(attributes::GENERATED_MESSAGES, generated);
        event.set_attribute(attributes::STALE_MESSAGES, stale);
        Ok(())
    }
}
