//! Point-to-point and criteria-based message dispatch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MessagingError, MessagingResult};
use crate::metadata::{
    ClusterPaths, MetadataStore, SessionId, StoreError, WriteExpectation,
};
use crate::model::{self, LiveInstance, Message, State};

/// Selects broadcast recipients among live instances.
#[derive(Clone)]
pub enum InstanceSelector {
    All,
    Exact(String),
    Matching(Arc<dyn Fn(&LiveInstance) -> bool + Send + Sync>),
}

/// Recipient criteria for a broadcast send.
#[derive(Clone)]
pub struct Criteria {
    pub instance: InstanceSelector,
}

impl Criteria {
    pub fn all() -> Self {
        Self {
            instance: InstanceSelector::All,
        }
    }

    pub fn instance(name: impl Into<String>) -> Self {
        Self {
            instance: InstanceSelector::Exact(name.into()),
        }
    }

    pub fn matching(predicate: impl Fn(&LiveInstance) -> bool + Send + Sync + 'static) -> Self {
        Self {
            instance: InstanceSelector::Matching(Arc::new(predicate)),
        }
    }

    fn accepts(&self, live: &LiveInstance) -> bool {
        match &self.instance {
            InstanceSelector::All => true,
            InstanceSelector::Exact(name) => live.instance == *name,
            InstanceSelector::Matching(predicate) => predicate(live),
        }
    }
}

/// Writes messages into recipients' queues through the store. The service
/// guarantees durable recording, not delivery: a recipient that never
/// connects never reads its queue, and the sender decides what to do with a
/// message that expires without a result.
#[derive(Clone)]
pub struct MessagingService {
    store: Arc<dyn MetadataStore>,
    paths: ClusterPaths,
}

impl MessagingService {
    pub fn new(store: Arc<dyn MetadataStore>, cluster: impl Into<String>) -> Self {
        Self {
            store,
            paths: ClusterPaths::new(cluster),
        }
    }

    /// Durably record a message for its target instance. Returns the
    /// message id.
    pub async fn send(&self, message: &Message, session: SessionId) -> MessagingResult<Uuid> {
        let path = self
            .paths
            .message(&message.target, &message.id.to_string());
        let data = model::encode(message)?;
        self.store
            .write(&path, data, WriteExpectation::Any, session)
            .await?;
        info!(
            message_id = %message.id,
            target = %message.target,
            resource = %message.resource,
            partition = %message.partition,
            from = %message.from_state,
            to = %message.to_state,
            "message sent"
        );
        Ok(message.id)
    }

    /// Send one message per live instance matching the criteria. The
    /// template's target fields are restamped per recipient; each copy gets
    /// its own id.
    pub async fn broadcast(
        &self,
        criteria: &Criteria,
        resource: impl Into<String>,
        partition: impl Into<String>,
        from_state: State,
        to_state: State,
        state_model_def: impl Into<String>,
        session: SessionId,
    ) -> MessagingResult<Vec<Uuid>> {
        let resource = resource.into();
        let partition = partition.into();
        let state_model_def = state_model_def.into();

        let recipients: Vec<LiveInstance> = self
            .live_instances()
            .await?
            .into_iter()
            .filter(|live| criteria.accepts(live))
            .collect();
        if recipients.is_empty() {
            return Err(MessagingError::NoRecipients);
        }

        let mut ids = Vec::with_capacity(recipients.len());
        for live in recipients {
            let message = Message::transition(
                live.instance.clone(),
                live.session,
                resource.clone(),
                partition.clone(),
                from_state.clone(),
                to_state.clone(),
                state_model_def.clone(),
            );
            ids.push(self.send(&message, session).await?);
        }
        Ok(ids)
    }

    /// Messages currently queued for an instance.
    pub async fn pending_messages(&self, instance: &str) -> MessagingResult<Vec<Message>> {
        let parent = self.paths.messages(instance);
        let mut messages = Vec::new();
        for child in self.store.children(&parent).await? {
            let path = format!("{parent}/{child}");
            match self.store.read(&path).await? {
                Some(record) => messages.push(model::decode(&path, record.data)?),
                None => continue,
            }
        }
        Ok(messages)
    }

    /// Remove a message from an instance's queue.
    pub async fn delete(&self, instance: &str, id: Uuid) -> MessagingResult<()> {
        self.store
            .delete(&self.paths.message(instance, &id.to_string()))
            .await?;
        Ok(())
    }

    /// Delete expired undelivered messages for an instance. Claimed
    /// (`Read`) messages are left alone until they expire too: a
    /// claimed-but-never-completed message means its executor may have
    /// crashed mid-transition, and blind redelivery of a non-idempotent
    /// handler is unsafe.
    pub async fn prune_expired(
        &self,
        instance: &str,
        now: DateTime<Utc>,
    ) -> MessagingResult<usize> {
        let mut pruned = 0;
        for message in self.pending_messages(instance).await? {
            if message.is_expired(now) {
                debug!(message_id = %message.id, target = instance, "pruning expired message");
                self.delete(instance, message.id).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            warn!(target = instance, count = pruned, "pruned expired messages");
        }
        Ok(pruned)
    }

    async fn live_instances(&self) -> Result<Vec<LiveInstance>, StoreError> {
        let parent = self.paths.live_instances();
        let mut instances = Vec::new();
        for child in self.store.children(&parent).await? {
            let path = format!("{parent}/{child}");
            if let Some(record) = self.store.read(&path).await? {
                instances.push(model::decode(&path, record.data)?);
            }
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CreateMode, MemoryStore};

    async fn service_with_live_instances(names: &[&str]) -> (MessagingService, SessionId) {
        let store = Arc::new(MemoryStore::new());
        let session = store.create_session().await.unwrap();
        let paths = ClusterPaths::new("test-cluster");
        for name in names {
            let live = LiveInstance::new(*name, session);
            store
                .create(
                    &paths.live_instance(name),
                    model::encode(&live).unwrap(),
                    CreateMode::Ephemeral,
                    session,
                )
                .await
                .unwrap();
        }
        (
            MessagingService::new(store as Arc<dyn MetadataStore>, "test-cluster"),
            session,
        )
    }

    #[tokio::test]
    async fn test_broadcast_to_all_live_instances() {
        let (service, session) = service_with_live_instances(&["node-1", "node-2"]).await;
        let ids = service
            .broadcast(
                &Criteria::all(),
                "db",
                "db_0",
                State::offline(),
                State::online(),
                "OnlineOffline",
                session,
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(service.pending_messages("node-1").await.unwrap().len(), 1);
        assert_eq!(service.pending_messages("node-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_with_exact_criteria() {
        let (service, session) = service_with_live_instances(&["node-1", "node-2"]).await;
        let ids = service
            .broadcast(
                &Criteria::instance("node-2"),
                "db",
                "db_0",
                State::offline(),
                State::online(),
                "OnlineOffline",
                session,
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(service.pending_messages("node-1").await.unwrap().is_empty());
        let pending = service.pending_messages("node-2").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_session, session);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_recipients() {
        let (service, session) = service_with_live_instances(&[]).await;
        let error = service
            .broadcast(
                &Criteria::all(),
                "db",
                "db_0",
                State::offline(),
                State::online(),
                "OnlineOffline",
                session,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, MessagingError::NoRecipients));
    }

    #[tokio::test]
    async fn test_prune_expired_removes_only_timed_out_messages() {
        let (service, session) = service_with_live_instances(&["node-1"]).await;
        let fresh = Message::transition(
            "node-1",
            session,
            "db",
            "db_0",
            State::offline(),
            State::online(),
            "OnlineOffline",
        )
        .with_timeout_ms(60_000);
        let mut expired = fresh.clone();
        expired.id = uuid::Uuid::new_v4();
        expired.timeout_ms = Some(10);
        expired.created_at = Utc::now() - chrono::Duration::seconds(5);
        service.send(&fresh, session).await.unwrap();
        service.send(&expired, session).await.unwrap();

        let pruned = service.prune_expired("node-1", Utc::now()).await.unwrap();
        assert_eq!(pruned, 1);
        let remaining = service.pending_messages("node-1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
    }
}
