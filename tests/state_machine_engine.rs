//! State-machine engine integration tests: transition validation, per-key
//! serialization, error handling, and current-state write-back.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Barrier;

use flock_core::manager::{NotificationContext, NotificationType};
use flock_core::metadata::{MetadataStore, SessionId};
use flock_core::model::{Message, State};
use flock_core::participant::{
    StateMachineEngine, StateModel, StateModelDef, StateModelFactory, TransitionError,
};

use common::{wait_until, TestCluster, CLUSTER};

/// OnlineOffline factory with instrumented handlers.
struct InstrumentedFactory {
    invoked: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    fail_offline_to_online: bool,
    delay: Duration,
    barrier: Option<Arc<Barrier>>,
}

impl InstrumentedFactory {
    fn new() -> Self {
        Self {
            invoked: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            fail_offline_to_online: false,
            delay: Duration::ZERO,
            barrier: None,
        }
    }
}

impl StateModelFactory for InstrumentedFactory {
    fn definition(&self) -> Arc<StateModelDef> {
        StateModelDef::online_offline()
    }

    fn create(&self, _key: &flock_core::model::PartitionKey) -> StateModel {
        self.created.fetch_add(1, Ordering::SeqCst);
        let invoked = self.invoked.clone();
        let in_flight = self.in_flight.clone();
        let max_in_flight = self.max_in_flight.clone();
        let fail = self.fail_offline_to_online;
        let delay = self.delay;
        let barrier = self.barrier.clone();
        StateModel::builder(self.definition())
            .on_fn("OFFLINE", "ONLINE", move |_message, _context| {
                let invoked = invoked.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                let barrier = barrier.clone();
                async move {
                    let depth = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(depth, Ordering::SeqCst);
                    if let Some(barrier) = barrier {
                        barrier.wait().await;
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    invoked.fetch_add(1, Ordering::SeqCst);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if fail {
                        return Err(TransitionError::Application("handler exploded".into()));
                    }
                    Ok(())
                }
            })
            .on_fn("ONLINE", "OFFLINE", |_message, _context| async { Ok(()) })
            .build()
    }
}

fn context(session: SessionId) -> NotificationContext {
    NotificationContext {
        notification_type: NotificationType::Callback,
        cluster: CLUSTER.to_string(),
        session: Some(session),
        at: Utc::now(),
    }
}

fn online_message(instance: &str, session: SessionId, partition: &str) -> Message {
    Message::transition(
        instance,
        session,
        "db",
        partition,
        State::offline(),
        State::online(),
        "OnlineOffline",
    )
}

async fn engine_with(
    cluster: &TestCluster,
    factory: Arc<dyn StateModelFactory>,
) -> (Arc<StateMachineEngine>, SessionId) {
    let session = cluster.store.create_session().await.unwrap();
    let engine = Arc::new(StateMachineEngine::new(
        cluster.store.clone() as Arc<dyn MetadataStore>,
        CLUSTER,
        "node-1",
    ));
    engine.register_factory(factory);
    (engine, session)
}

#[tokio::test]
async fn test_valid_transition_advances_state_with_one_write() {
    let cluster = TestCluster::new().await;
    let factory = Arc::new(InstrumentedFactory::new());
    let invoked = factory.invoked.clone();
    let (engine, session) = engine_with(&cluster, factory).await;

    let new_state = engine
        .execute_transition(&online_message("node-1", session, "db_0"), &context(session))
        .await
        .unwrap();
    assert_eq!(new_state, State::online());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.recorded_state("db", "db_0").await,
        Some(State::online())
    );

    // Exactly one store write: the record exists at version 0.
    let path = cluster.paths.current_state("node-1", session, "db");
    let record = cluster.store.read(&path).await.unwrap().unwrap();
    assert_eq!(record.version, 0);
    let current = cluster
        .current_state_record("node-1", session, "db")
        .await
        .unwrap();
    assert_eq!(current.state_of("db_0"), Some(&State::online()));
}

#[tokio::test]
async fn test_mismatched_from_state_rejected_without_handler() {
    let cluster = TestCluster::new().await;
    let factory = Arc::new(InstrumentedFactory::new());
    let invoked = factory.invoked.clone();
    let (engine, session) = engine_with(&cluster, factory).await;

    // Recorded state is OFFLINE (initial); a message claiming ONLINE must
    // be rejected before any handler runs.
    let message = Message::transition(
        "node-1",
        session,
        "db",
        "db_0",
        State::online(),
        State::offline(),
        "OnlineOffline",
    );
    let error = engine
        .execute_transition(&message, &context(session))
        .await
        .unwrap_err();
    assert!(matches!(error, TransitionError::InvalidTransition { .. }));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(
        engine.recorded_state("db", "db_0").await,
        Some(State::offline())
    );
    // No state mutation means no current-state write either.
    assert!(cluster
        .current_state_record("node-1", session, "db")
        .await
        .is_none());
}

#[tokio::test]
async fn test_undefined_edge_rejected() {
    let cluster = TestCluster::new().await;
    let (engine, session) = engine_with(&cluster, Arc::new(InstrumentedFactory::new())).await;

    // OFFLINE -> DROPPED is in the definition but has no handler here;
    // ONLINE -> DROPPED is not even an edge. Both are NoSuchTransition.
    let message = Message::transition(
        "node-1",
        session,
        "db",
        "db_0",
        State::offline(),
        State::dropped(),
        "OnlineOffline",
    );
    let error = engine
        .execute_transition(&message, &context(session))
        .await
        .unwrap_err();
    assert!(matches!(error, TransitionError::NoSuchTransition { .. }));
}

#[tokio::test]
async fn test_unknown_state_model_rejected() {
    let cluster = TestCluster::new().await;
    let (engine, session) = engine_with(&cluster, Arc::new(InstrumentedFactory::new())).await;

    let mut message = online_message("node-1", session, "db_0");
    message.state_model_def = "LeaderStandby".to_string();
    let error = engine
        .execute_transition(&message, &context(session))
        .await
        .unwrap_err();
    assert!(matches!(error, TransitionError::NoSuchFactory { .. }));
}

#[tokio::test]
async fn test_handler_failure_moves_to_error() {
    let cluster = TestCluster::new().await;
    let mut factory = InstrumentedFactory::new();
    factory.fail_offline_to_online = true;
    let (engine, session) = engine_with(&cluster, Arc::new(factory)).await;

    let error = engine
        .execute_transition(&online_message("node-1", session, "db_0"), &context(session))
        .await
        .unwrap_err();
    assert!(matches!(error, TransitionError::HandlerFailed { .. }));
    assert_eq!(
        engine.recorded_state("db", "db_0").await,
        Some(State::error())
    );
    let current = cluster
        .current_state_record("node-1", session, "db")
        .await
        .unwrap();
    assert_eq!(current.state_of("db_0"), Some(&State::error()));
}

#[tokio::test]
async fn test_same_key_transitions_serialized() {
    let cluster = TestCluster::new().await;
    let mut factory = InstrumentedFactory::new();
    factory.delay = Duration::from_millis(50);
    let factory = Arc::new(factory);
    let max_in_flight = factory.max_in_flight.clone();
    let (engine, session) = engine_with(&cluster, factory).await;

    // Two concurrent messages for the same key: the second queues on the
    // replica and is then rejected because the state already moved on.
    let first = tokio::spawn({
        let engine = engine.clone();
        let message = online_message("node-1", session, "db_0");
        let ctx = context(session);
        async move { engine.execute_transition(&message, &ctx).await }
    });
    let second = tokio::spawn({
        let engine = engine.clone();
        let message = online_message("node-1", session, "db_0");
        let ctx = context(session);
        async move { engine.execute_transition(&message, &ctx).await }
    });

    let outcomes = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, Err(TransitionError::InvalidTransition { .. }))));
    assert_eq!(
        engine.recorded_state("db", "db_0").await,
        Some(State::online())
    );
}

#[tokio::test]
async fn test_distinct_keys_run_concurrently() {
    let cluster = TestCluster::new().await;
    let mut factory = InstrumentedFactory::new();
    // Both handlers must be inside the handler at once to pass the barrier;
    // serialization across distinct keys would deadlock here.
    factory.barrier = Some(Arc::new(Barrier::new(2)));
    let (engine, session) = engine_with(&cluster, Arc::new(factory)).await;

    let a = tokio::spawn({
        let engine = engine.clone();
        let message = online_message("node-1", session, "db_0");
        let ctx = context(session);
        async move { engine.execute_transition(&message, &ctx).await }
    });
    let b = tokio::spawn({
        let engine = engine.clone();
        let message = online_message("node-1", session, "db_1");
        let ctx = context(session);
        async move { engine.execute_transition(&message, &ctx).await }
    });

    let both = tokio::time::timeout(Duration::from_secs(5), async {
        (a.await.unwrap(), b.await.unwrap())
    })
    .await
    .expect("distinct keys should transition concurrently");
    assert!(both.0.is_ok());
    assert!(both.1.is_ok());
}

#[tokio::test]
async fn test_factory_creates_one_model_per_key() {
    let cluster = TestCluster::new().await;
    let factory = Arc::new(InstrumentedFactory::new());
    let created = factory.created.clone();
    let (engine, session) = engine_with(&cluster, factory).await;

    engine
        .execute_transition(&online_message("node-1", session, "db_0"), &context(session))
        .await
        .unwrap();
    // Drive the same key back and forth; the model is reused.
    let back = Message::transition(
        "node-1",
        session,
        "db",
        "db_0",
        State::online(),
        State::offline(),
        "OnlineOffline",
    );
    engine
        .execute_transition(&back, &context(session))
        .await
        .unwrap();
    engine
        .execute_transition(&online_message("node-1", session, "db_0"), &context(session))
        .await
        .unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);

    engine
        .execute_transition(&online_message("node-1", session, "db_1"), &context(session))
        .await
        .unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reset_all_rolls_back_to_initial() {
    let cluster = TestCluster::new().await;
    let (engine, session) = engine_with(&cluster, Arc::new(InstrumentedFactory::new())).await;

    engine
        .execute_transition(&online_message("node-1", session, "db_0"), &context(session))
        .await
        .unwrap();
    assert_eq!(
        engine.recorded_state("db", "db_0").await,
        Some(State::online())
    );

    engine.reset_all().await;
    wait_until("replica reset", Duration::from_secs(1), || {
        let engine = engine.clone();
        async move { engine.recorded_state("db", "db_0").await == Some(State::offline()) }
    })
    .await;
}
