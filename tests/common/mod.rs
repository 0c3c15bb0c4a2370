//! Shared test harness: an in-memory cluster with helpers for seeding
//! ideal states, starting participants and controllers, and waiting for
//! convergence.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use async_trait::async_trait;
use flock_core::config::FlockConfig;
use flock_core::controller::GenericController;
use flock_core::manager::{
    ChangeNotification, ClusterChangeListener, ClusterManager, InstanceType, NotificationContext,
    NotificationType,
};
use flock_core::metadata::{
    ClusterPaths, MemoryStore, MetadataStore, SessionId, WriteExpectation,
};
use flock_core::model::{self, CurrentState, ExternalView, IdealState, State};
use flock_core::participant::{
    MessageConsumer, OnlineOfflineStateModelFactory, StateMachineEngine, StateModelFactory,
};

pub const CLUSTER: &str = "test-cluster";

pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub paths: ClusterPaths,
    admin_session: SessionId,
}

impl TestCluster {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let admin_session = store.create_session().await.expect("admin session");
        Self {
            store,
            paths: ClusterPaths::new(CLUSTER),
            admin_session,
        }
    }

    pub fn config() -> FlockConfig {
        let mut config = FlockConfig::default();
        // Fast cadence so convergence tests finish quickly.
        config.pipeline.periodic_rebalance_interval_ms = 200;
        config
    }

    pub async fn seed_ideal_state(&self, ideal: &IdealState) {
        let path = self.paths.ideal_state(&ideal.resource);
        self.store
            .write(
                &path,
                model::encode(ideal).expect("encode ideal state"),
                WriteExpectation::Any,
                self.admin_session,
            )
            .await
            .expect("seed ideal state");
    }

    /// Start a participant with the given state model factory and wire its
    /// message consumer.
    pub async fn start_participant_with_factory(
        &self,
        name: &str,
        factory: Arc<dyn StateModelFactory>,
    ) -> Participant {
        let manager = ClusterManager::new(
            CLUSTER,
            name,
            InstanceType::Participant,
            self.store.clone() as Arc<dyn MetadataStore>,
            Self::config(),
        );
        manager.connect().await.expect("participant connect");

        let engine = Arc::new(StateMachineEngine::new(
            self.store.clone() as Arc<dyn MetadataStore>,
            CLUSTER,
            name,
        ));
        engine.register_factory(factory);
        let consumer = MessageConsumer::new(
            engine.clone(),
            self.store.clone() as Arc<dyn MetadataStore>,
            CLUSTER,
            name,
            16,
        );
        manager
            .add_message_listener(Arc::new(consumer.clone()), name)
            .await
            .expect("message listener");
        Participant {
            manager,
            engine,
            consumer,
        }
    }

    pub async fn start_participant(&self, name: &str) -> Participant {
        self.start_participant_with_factory(name, Arc::new(OnlineOfflineStateModelFactory::new()))
            .await
    }

    pub async fn start_controller(&self, name: &str) -> (ClusterManager, GenericController) {
        let manager = ClusterManager::new(
            CLUSTER,
            name,
            InstanceType::Controller,
            self.store.clone() as Arc<dyn MetadataStore>,
            Self::config(),
        );
        manager.connect().await.expect("controller connect");
        let controller = GenericController::start(manager.clone())
            .await
            .expect("controller start");
        (manager, controller)
    }

    pub async fn external_view(&self, resource: &str) -> Option<ExternalView> {
        let path = self.paths.external_view(resource);
        let record = self.store.read(&path).await.expect("read external view")?;
        Some(model::decode(&path, record.data).expect("decode external view"))
    }

    pub async fn current_state_record(
        &self,
        instance: &str,
        session: SessionId,
        resource: &str,
    ) -> Option<CurrentState> {
        let path = self.paths.current_state(instance, session, resource);
        let record = self.store.read(&path).await.expect("read current state")?;
        Some(model::decode(&path, record.data).expect("decode current state"))
    }
}

pub struct Participant {
    pub manager: ClusterManager,
    pub engine: Arc<StateMachineEngine>,
    pub consumer: MessageConsumer,
}

/// Poll until the condition holds or the deadline passes.
pub async fn wait_until<F, Fut>(what: &str, deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if condition().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A convenient online-offline ideal state for one resource.
pub fn online_ideal(resource: &str, partitions: &[&str], instance: &str) -> IdealState {
    let mut ideal = IdealState::new(resource, "OnlineOffline");
    for partition in partitions {
        ideal = ideal.assign(*partition, instance, State::online());
    }
    ideal
}

/// Records every notification it receives, for delivery-accounting tests.
#[derive(Clone, Default)]
pub struct RecordingListener {
    deliveries: Arc<Mutex<Vec<(NotificationType, Option<SessionId>)>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(NotificationType, Option<SessionId>)> {
        self.deliveries.lock().clone()
    }

    pub fn count_of(&self, kind: NotificationType) -> usize {
        self.deliveries
            .lock()
            .iter()
            .filter(|(delivered, _)| *delivered == kind)
            .count()
    }
}

#[async_trait]
impl ClusterChangeListener for RecordingListener {
    async fn on_change(&self, _change: ChangeNotification, context: &NotificationContext) {
        self.deliveries
            .lock()
            .push((context.notification_type, context.session));
    }
}
