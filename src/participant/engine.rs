//! Transition execution engine.
//!
//! Owns every partition replica's in-memory state and the per-key mutex
//! that serializes its transitions. A message whose `from_state` does not
//! match the recorded state is rejected without invoking any handler; a
//! handler failure moves the replica to ERROR and is never retried by the
//! engine itself.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::factory::StateModelFactory;
use super::state_model::StateModel;
use super::{TransitionError, TransitionResult};
use crate::manager::NotificationContext;
use crate::metadata::{ClusterPaths, MetadataStore, SessionId, WriteExpectation};
use crate::model::{self, CurrentState, Message, PartitionKey, State};

/// One partition replica: its model (handler table) and recorded state.
/// The state mutex is the per-key serialization point; at most one
/// transition holds it at a time.
pub struct PartitionReplica {
    key: PartitionKey,
    model: StateModel,
    state: tokio::sync::Mutex<State>,
}

impl PartitionReplica {
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub async fn current_state(&self) -> State {
        self.state.lock().await.clone()
    }
}

pub struct StateMachineEngine {
    store: Arc<dyn MetadataStore>,
    paths: ClusterPaths,
    instance: String,
    factories: DashMap<String, Arc<dyn StateModelFactory>>,
    default_factory: RwLock<Option<Arc<dyn StateModelFactory>>>,
    replicas: DashMap<PartitionKey, Arc<PartitionReplica>>,
}

impl StateMachineEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cluster: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            store,
            paths: ClusterPaths::new(cluster),
            instance: instance.into(),
            factories: DashMap::new(),
            default_factory: RwLock::new(None),
            replicas: DashMap::new(),
        }
    }

    /// Register a factory for one state model definition name.
    pub fn register_factory(&self, factory: Arc<dyn StateModelFactory>) {
        let name = factory.definition().name().to_string();
        self.factories.insert(name, factory);
    }

    /// Factory used when a message names a definition with no registered
    /// factory.
    pub fn register_default_factory(&self, factory: Arc<dyn StateModelFactory>) {
        *self.default_factory.write() = Some(factory);
    }

    fn factory_for(&self, state_model_def: &str) -> TransitionResult<Arc<dyn StateModelFactory>> {
        if let Some(factory) = self.factories.get(state_model_def) {
            return Ok(Arc::clone(factory.value()));
        }
        self.default_factory
            .read()
            .clone()
            .ok_or_else(|| TransitionError::NoSuchFactory {
                state_model: state_model_def.to_string(),
            })
    }

    /// The single replica for this key, created via its factory on first
    /// reference and reused for the life of the process.
    pub fn get_or_create(
        &self,
        resource: &str,
        partition: &str,
        state_model_def: &str,
    ) -> TransitionResult<Arc<PartitionReplica>> {
        let key = PartitionKey::new(resource, partition);
        if let Some(existing) = self.replicas.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        let factory = self.factory_for(state_model_def)?;
        let entry = self
            .replicas
            .entry(key.clone())
            .or_insert_with(|| {
                let model = factory.create(&key);
                let initial = model.def().initial_state().clone();
                Arc::new(PartitionReplica {
                    key,
                    model,
                    state: tokio::sync::Mutex::new(initial),
                })
            });
        Ok(Arc::clone(entry.value()))
    }

    /// Recorded state of a replica, if it has been referenced before.
    pub async fn recorded_state(&self, resource: &str, partition: &str) -> Option<State> {
        let key = PartitionKey::new(resource, partition);
        let replica = Arc::clone(self.replicas.get(&key)?.value());
        Some(replica.current_state().await)
    }

    /// Execute one transition message. Serialized per key: a second message
    /// for a busy key queues on the replica mutex rather than interleaving.
    pub async fn execute_transition(
        &self,
        message: &Message,
        context: &NotificationContext,
    ) -> TransitionResult<State> {
        let session = context.session.ok_or(TransitionError::MissingSession)?;
        let replica =
            self.get_or_create(&message.resource, &message.partition, &message.state_model_def)?;

        let mut state = replica.state.lock().await;
        if *state != message.from_state {
            warn!(
                key = %replica.key,
                recorded = %*state,
                expected = %message.from_state,
                "rejecting transition: recorded state does not match"
            );
            return Err(TransitionError::InvalidTransition {
                key: replica.key.clone(),
                expected: message.from_state.clone(),
                actual: state.clone(),
            });
        }

        let def = replica.model.def();
        if !def.has_transition(&message.from_state, &message.to_state) {
            return Err(TransitionError::NoSuchTransition {
                state_model: def.name().to_string(),
                from: message.from_state.clone(),
                to: message.to_state.clone(),
            });
        }
        let handler = replica
            .model
            .handler_for(&message.from_state, &message.to_state)
            .ok_or_else(|| TransitionError::NoSuchTransition {
                state_model: def.name().to_string(),
                from: message.from_state.clone(),
                to: message.to_state.clone(),
            })?
            .clone();

        info!(
            key = %replica.key,
            from = %message.from_state,
            to = %message.to_state,
            message_id = %message.id,
            "executing transition"
        );
        match handler.run(message.clone(), context.clone()).await {
            Ok(()) => {
                *state = message.to_state.clone();
                self.write_current_state(message, &state, session).await?;
                Ok(state.clone())
            }
            Err(error) => {
                *state = State::error();
                // Session loss makes this write fail; a later session
                // reports fresh state, so the failure is harmless.
                if let Err(write_error) = self.write_current_state(message, &state, session).await {
                    warn!(%write_error, key = %replica.key, "failed to record ERROR state");
                }
                Err(TransitionError::HandlerFailed {
                    key: replica.key.clone(),
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Roll every replica back to its model's initial state. Invoked when a
    /// session ends: the next session reports state rebuilt from scratch.
    pub async fn reset_all(&self) {
        let replicas: Vec<Arc<PartitionReplica>> =
            self.replicas.iter().map(|e| e.value().clone()).collect();
        for replica in replicas {
            let mut state = replica.state.lock().await;
            let initial = replica.model.def().initial_state().clone();
            if *state != initial {
                info!(key = %replica.key, from = %*state, to = %initial, "resetting replica");
                *state = initial;
            }
        }
    }

    /// Persist the replica's new state. One store write per transition.
    async fn write_current_state(
        &self,
        message: &Message,
        state: &State,
        session: SessionId,
    ) -> TransitionResult<()> {
        let path = self
            .paths
            .current_state(&self.instance, session, &message.resource);
        let mut record = match self.store.read(&path).await? {
            Some(existing) => model::decode::<CurrentState>(&path, existing.data)?,
            None => CurrentState::new(
                message.resource.clone(),
                session,
                message.state_model_def.clone(),
            ),
        };
        record.set(message.partition.clone(), state.clone());
        self.store
            .write(&path, model::encode(&record)?, WriteExpectation::Any, session)
            .await?;
        Ok(())
    }
}
