//! Message consumption for one participant.
//!
//! Listens on the instance's MESSAGES subtree, claims each new message with
//! a version-checked write, drives the engine, records the result, and
//! deletes the message. The claim CAS makes duplicate delivery a detectable
//! no-op; a bounded semaphore caps transitions in flight across keys.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::StateMachineEngine;
use super::TransitionError;
use crate::manager::{
    ChangeNotification, ClusterChangeListener, NotificationContext, NotificationType,
};
use crate::metadata::{
    ClusterPaths, MetadataStore, SessionId, StoreError, StoreResult, WriteExpectation,
};
use crate::model::{self, Message, MessageState, State};

/// Failure record written under the instance's ERRORS path when a message
/// is rejected or its handler fails.
#[derive(Debug, Clone, Serialize)]
struct TransitionErrorRecord {
    message_id: Uuid,
    resource: String,
    partition: String,
    from_state: State,
    to_state: State,
    error: String,
    at: DateTime<Utc>,
}

struct ConsumerInner {
    engine: Arc<StateMachineEngine>,
    store: Arc<dyn MetadataStore>,
    paths: ClusterPaths,
    instance: String,
    limiter: Arc<Semaphore>,
    in_flight: DashMap<Uuid, AbortHandle>,
}

/// Participant-side message listener. Cheap to clone; register it with
/// [`crate::manager::ClusterManager::add_message_listener`].
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

impl MessageConsumer {
    pub fn new(
        engine: Arc<StateMachineEngine>,
        store: Arc<dyn MetadataStore>,
        cluster: impl Into<String>,
        instance: impl Into<String>,
        max_concurrent_transitions: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                engine,
                store,
                paths: ClusterPaths::new(cluster),
                instance: instance.into(),
                limiter: Arc::new(Semaphore::new(max_concurrent_transitions.max(1))),
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Abort in-flight executions. Exposed for shutdown; session loss alone
    /// does not cancel running transitions.
    pub fn cancel_all(&self) {
        for entry in self.inner.in_flight.iter() {
            entry.value().abort();
        }
        self.inner.in_flight.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl ConsumerInner {
    /// Mark the message `Read` so no other delivery executes it. Returns
    /// `false` when the message is gone or was already claimed.
    async fn claim(&self, message: &Message, session: SessionId) -> StoreResult<bool> {
        let path = self.paths.message(&self.instance, &message.id.to_string());
        let Some(record) = self.store.read(&path).await? else {
            return Ok(false);
        };
        let stored: Message = model::decode(&path, record.data)?;
        if stored.msg_state != MessageState::New {
            return Ok(false);
        }
        let mut claimed = stored;
        claimed.msg_state = MessageState::Read;
        match self
            .store
            .write(
                &path,
                model::encode(&claimed)?,
                WriteExpectation::Version(record.version),
                session,
            )
            .await
        {
            Ok(_) => Ok(true),
            // Lost the race: another delivery claimed or the record moved on.
            Err(StoreError::BadVersion { .. }) | Err(StoreError::NoNode { .. }) => {
                debug!(message_id = %message.id, "duplicate delivery ignored");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    fn spawn_execution(self: &Arc<Self>, message: Message, context: NotificationContext) {
        let inner = self.clone();
        let id = message.id;
        let handle = tokio::spawn(async move {
            let _permit = match inner.limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let result = inner.engine.execute_transition(&message, &context).await;
            inner.finish(message, result, &context).await;
            inner.in_flight.remove(&id);
        });
        self.in_flight.insert(id, handle.abort_handle());
    }

    /// Write the outcome back and delete the message. Write-backs under a
    /// dead session fail; a later session reports fresh state instead.
    async fn finish(
        &self,
        message: Message,
        result: Result<State, TransitionError>,
        context: &NotificationContext,
    ) {
        let Some(session) = context.session else {
            return;
        };
        let path = self.paths.message(&self.instance, &message.id.to_string());
        let final_state = match &result {
            Ok(new_state) => {
                info!(
                    message_id = %message.id,
                    resource = %message.resource,
                    partition = %message.partition,
                    new_state = %new_state,
                    "transition complete"
                );
                MessageState::Completed
            }
            Err(error) => {
                warn!(
                    message_id = %message.id,
                    resource = %message.resource,
                    partition = %message.partition,
                    %error,
                    "transition failed"
                );
                self.record_error(&message, error, session).await;
                MessageState::Error
            }
        };

        let mut finished = message;
        finished.msg_state = final_state;
        match model::encode(&finished) {
            Ok(data) => {
                if let Err(error) = self
                    .store
                    .write(&path, data, WriteExpectation::Any, session)
                    .await
                {
                    warn!(message_id = %finished.id, %error, "failed to record message result");
                }
            }
            Err(error) => warn!(message_id = %finished.id, %error, "failed to encode result"),
        }
        if let Err(error) = self.store.delete(&path).await {
            warn!(message_id = %finished.id, %error, "failed to delete consumed message");
        }
    }

    async fn record_error(&self, message: &Message, error: &TransitionError, session: SessionId) {
        let record = TransitionErrorRecord {
            message_id: message.id,
            resource: message.resource.clone(),
            partition: message.partition.clone(),
            from_state: message.from_state.clone(),
            to_state: message.to_state.clone(),
            error: error.to_string(),
            at: Utc::now(),
        };
        let path = self.paths.error(&self.instance, &message.id.to_string());
        let data = match model::encode(&record) {
            Ok(data) => data,
            Err(encode_error) => {
                warn!(message_id = %message.id, %encode_error, "failed to encode error record");
                return;
            }
        };
        if let Err(write_error) = self
            .store
            .write(&path, data, WriteExpectation::Any, session)
            .await
        {
            warn!(message_id = %message.id, %write_error, "failed to write error record");
        }
    }
}

#[async_trait]
impl ClusterChangeListener for MessageConsumer {
    async fn on_change(&self, change: ChangeNotification, context: &NotificationContext) {
        if context.notification_type == NotificationType::Finalize {
            // Session over: models roll back to their initial state so the
            // next session reports from scratch. In-flight transitions run
            // to completion; their write-backs fail harmlessly.
            let engine = self.inner.engine.clone();
            tokio::spawn(async move { engine.reset_all().await });
            return;
        }
        let ChangeNotification::Messages { messages, .. } = change else {
            return;
        };
        let Some(session) = context.session else {
            return;
        };
        for message in messages {
            if message.msg_state != MessageState::New {
                continue;
            }
            // Addressed to a session this instance no longer holds; the
            // controller prunes these.
            if message.target_session != session {
                debug!(message_id = %message.id, "skipping message for a stale session");
                continue;
            }
            if self.inner.in_flight.contains_key(&message.id) {
                continue;
            }
            match self.inner.claim(&message, session).await {
                Ok(true) => self.inner.spawn_execution(message, context.clone()),
                Ok(false) => {}
                Err(error) => {
                    warn!(message_id = %message.id, %error, "failed to claim message");
                }
            }
        }
    }
}
