//! Manager lifecycle and session-expiry recovery: INIT/CALLBACK/FINALIZE
//! accounting, ephemeral cleanup, and connect/disconnect semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use flock_core::manager::{
    ClusterManager, ConnectionState, InstanceType, ManagerError, NotificationType,
};
use flock_core::metadata::{MetadataStore, WriteExpectation};
use flock_core::model::{self, InstanceConfig};

use common::{wait_until, RecordingListener, TestCluster, CLUSTER};

fn participant_manager(cluster: &TestCluster, name: &str) -> ClusterManager {
    ClusterManager::new(
        CLUSTER,
        name,
        InstanceType::Participant,
        cluster.store.clone() as Arc<dyn MetadataStore>,
        TestCluster::config(),
    )
}

#[tokio::test]
async fn test_connect_is_not_reentrant() -> anyhow::Result<()> {
    let cluster = TestCluster::new().await;
    let manager = participant_manager(&cluster, "node-1");

    manager.connect().await?;
    assert!(manager.is_connected());
    let error = manager.connect().await.unwrap_err();
    assert!(matches!(error, ManagerError::AlreadyConnected));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_is_terminal() -> anyhow::Result<()> {
    let cluster = TestCluster::new().await;
    let manager = participant_manager(&cluster, "node-1");
    manager.connect().await?;
    let live_path = cluster.paths.live_instance("node-1");
    assert!(cluster.store.read(&live_path).await?.is_some());

    manager.disconnect().await?;
    assert!(!manager.is_connected());
    assert_eq!(manager.current_lifecycle().await, ConnectionState::Terminated);
    // Ephemeral presence is gone with the session.
    assert!(cluster.store.read(&live_path).await?.is_none());
    // A terminated manager is never reused.
    let error = manager.connect().await.unwrap_err();
    assert!(matches!(error, ManagerError::Terminated));
    Ok(())
}

#[tokio::test]
async fn test_listener_gets_synchronous_init_then_ordered_callbacks() {
    let cluster = TestCluster::new().await;
    let manager = participant_manager(&cluster, "node-1");
    manager.connect().await.unwrap();
    let admin = cluster.store.create_session().await.unwrap();

    let listener = RecordingListener::new();
    manager
        .add_instance_config_listener(Arc::new(listener.clone()))
        .await
        .unwrap();
    // INIT is delivered synchronously inside add_listener.
    assert_eq!(listener.count_of(NotificationType::Init), 1);

    // One change at a time: bursts may legitimately coalesce into fewer
    // callbacks, but each settled change is always observed.
    for n in 0usize..3 {
        let config = InstanceConfig::new(format!("node-{n}"));
        cluster
            .store
            .write(
                &cluster.paths.config(&config.instance),
                model::encode(&config).unwrap(),
                WriteExpectation::Any,
                admin,
            )
            .await
            .unwrap();
        wait_until("config callback", Duration::from_secs(5), || {
            let listener = listener.clone();
            async move { listener.count_of(NotificationType::Callback) >= n + 1 }
        })
        .await;
    }
    assert_eq!(listener.count_of(NotificationType::Finalize), 0);
    assert!(manager.last_notification_time().is_some());
}

#[tokio::test]
async fn test_remove_listener_delivers_one_finalize() {
    let cluster = TestCluster::new().await;
    let manager = participant_manager(&cluster, "node-1");
    manager.connect().await.unwrap();

    let listener = RecordingListener::new();
    let handle = manager
        .add_live_instance_listener(Arc::new(listener.clone()))
        .await
        .unwrap();
    assert!(manager.remove_listener(handle).await.unwrap());
    assert_eq!(listener.count_of(NotificationType::Finalize), 1);
    // Removing again is a no-op.
    assert!(!manager.remove_listener(handle).await.unwrap());
    assert_eq!(listener.count_of(NotificationType::Finalize), 1);
}

#[tokio::test]
async fn test_session_expiry_finalizes_then_reinitializes_listeners() {
    let cluster = TestCluster::new().await;
    let manager = participant_manager(&cluster, "node-1");
    manager.connect().await.unwrap();
    let first_session = manager.session_id().unwrap();

    let listener = RecordingListener::new();
    manager
        .add_live_instance_listener(Arc::new(listener.clone()))
        .await
        .unwrap();
    let baseline = listener.deliveries().len();

    cluster.store.expire_session(first_session);

    wait_until("recovered session", Duration::from_secs(5), || {
        let manager = manager.clone();
        async move {
            manager.is_connected() && manager.session_id() != Some(first_session)
        }
    })
    .await;
    wait_until("re-INIT after recovery", Duration::from_secs(5), || {
        let listener = listener.clone();
        async move { listener.count_of(NotificationType::Init) >= 2 }
    })
    .await;

    // Exactly one FINALIZE (tagged with the expired session), then exactly
    // one fresh INIT, with no CALLBACK in between for the dead session.
    let after: Vec<_> = listener.deliveries()[baseline..].to_vec();
    let finalizes: Vec<_> = after
        .iter()
        .filter(|(kind, _)| *kind == NotificationType::Finalize)
        .collect();
    assert_eq!(finalizes.len(), 1);
    assert_eq!(finalizes[0].1, Some(first_session));
    assert_eq!(
        after
            .iter()
            .filter(|(kind, _)| *kind == NotificationType::Init)
            .count(),
        1
    );
    let finalize_pos = after
        .iter()
        .position(|(kind, _)| *kind == NotificationType::Finalize)
        .unwrap();
    let init_pos = after
        .iter()
        .position(|(kind, _)| *kind == NotificationType::Init)
        .unwrap();
    assert!(finalize_pos < init_pos);
    assert!(!after[finalize_pos..init_pos]
        .iter()
        .any(|(kind, _)| *kind == NotificationType::Callback));

    // The live-instance ephemeral was re-published under the new session.
    let live_path = cluster.paths.live_instance("node-1");
    let record = cluster.store.read(&live_path).await.unwrap().unwrap();
    let live: flock_core::model::LiveInstance = model::decode(&live_path, record.data).unwrap();
    assert_eq!(Some(live.session), manager.session_id());
}

#[tokio::test]
async fn test_expiry_of_foreign_session_is_ignored() {
    let cluster = TestCluster::new().await;
    let manager = participant_manager(&cluster, "node-1");
    manager.connect().await.unwrap();
    let session = manager.session_id().unwrap();

    let listener = RecordingListener::new();
    manager
        .add_live_instance_listener(Arc::new(listener.clone()))
        .await
        .unwrap();

    let other = cluster.store.create_session().await.unwrap();
    cluster.store.expire_session(other);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.session_id(), Some(session));
    assert_eq!(listener.count_of(NotificationType::Finalize), 0);
}
