//! Fifth stage: write generated messages to the store and drop stale ones.

use async_trait::async_trait;
use tracing::info;

use crate::controller::event::{attributes, ClusterEvent};
use crate::controller::stage::{Stage, StageContext, StageError, StageResult};
use crate::messaging::MessagingService;
use crate::metadata::SessionId;
use crate::model::Message;

use super::message_generation::StaleMessage;

pub struct MessageDispatchStage {
    service: Option<MessagingService>,
}

impl Default for MessageDispatchStage {
    fn default() -> Self {
        Self { service: None }
    }
}

impl MessageDispatchStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for MessageDispatchStage {
    fn name(&self) -> &'static str {
        "MessageDispatch"
    }

    async fn init(&mut self, context: StageContext) {
        self.service = Some(MessagingService::new(
            context.store.clone(),
            context.cluster.clone(),
        ));
    }

    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()> {
        let service = self.service.as_ref().ok_or(StageError::NotInitialized {
            stage: self.name(),
        })?;
        let session = *event
            .attribute::<SessionId>(attributes::SESSION)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::SESSION,
            })?;
        let generated = event
            .attribute::<Vec<Message>>(attributes::GENERATED_MESSAGES)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::GENERATED_MESSAGES,
            })?
            .clone();
        let stale = event
            .attribute::<Vec<StaleMessage>>(attributes::STALE_MESSAGES)
            .cloned()
            .unwrap_or_default();

        for doomed in &stale {
            service.delete(&doomed.instance, doomed.id).await?;
        }

        let sent = generated.len();
        for message in &generated {
            service.send(message, session).await?;
        }
        if sent > 0 || !stale.is_empty() {
            info!(sent, pruned = stale.len(), "message dispatch complete");
        }
        Ok(())
    }
}
