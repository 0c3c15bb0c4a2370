//! The generic controller: wires change listeners to coalesced pipeline
//! runs, manages per-instance message and current-state listeners, and
//! gates everything on leadership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::{attributes, ClusterEvent};
use super::pipeline::{Pipeline, PipelineRegistry};
use super::stage::{StageContext, StageError};
use super::stages::{
    BestPossibleStateStage, CurrentStateStage, ExternalViewStage, MessageDispatchStage,
    MessageGenerationStage, ReadClusterDataStage,
};
use super::StateModelDefRegistry;
use crate::constants::events;
use crate::error::{FlockError, Result};
use crate::manager::{
    ChangeNotification, ClusterChangeListener, ClusterManager, InstanceType, ListenerHandle,
    NotificationContext, NotificationType,
};
use crate::metadata::SessionId;
use crate::model;
use crate::model::LiveInstance;

/// Listener that turns store notifications into queued cluster events. The
/// payload is deliberately ignored: pipeline runs re-read store state.
struct EventForwarder {
    event_name: &'static str,
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

#[async_trait]
impl ClusterChangeListener for EventForwarder {
    async fn on_change(&self, _change: ChangeNotification, context: &NotificationContext) {
        if context.notification_type == NotificationType::Finalize {
            return;
        }
        let _ = self.tx.send(ClusterEvent::new(self.event_name));
    }
}

struct ControllerInner {
    manager: ClusterManager,
    registry: PipelineRegistry,
    defs: StateModelDefRegistry,
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
    /// instance -> (session it was registered under, listener handles)
    instance_listeners: tokio::sync::Mutex<HashMap<String, (SessionId, Vec<ListenerHandle>)>>,
    forwarder_handles: tokio::sync::Mutex<Vec<ListenerHandle>>,
    runner: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ControllerInner {
    fn forwarder(&self, event_name: &'static str) -> Arc<dyn ClusterChangeListener> {
        Arc::new(EventForwarder {
            event_name,
            tx: self.event_tx.clone(),
        })
    }

    /// Keep one message listener and one current-state listener per live
    /// instance, re-registering when an instance reconnects under a new
    /// session.
    async fn sync_instance_listeners(&self) {
        let live = match self.read_live_instances().await {
            Ok(live) => live,
            Err(error) => {
                warn!(%error, "could not read live instances for listener sync");
                return;
            }
        };
        let mut tracked = self.instance_listeners.lock().await;

        let stale: Vec<String> = tracked
            .iter()
            .filter(|(name, (session, _))| live.get(*name) != Some(session))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some((_, handles)) = tracked.remove(&name) {
                debug!(instance = %name, "dropping listeners for departed instance");
                for handle in handles {
                    let _ = self.manager.remove_listener(handle).await;
                }
            }
        }

        for (name, session) in live {
            if tracked.contains_key(&name) {
                continue;
            }
            let mut handles = Vec::new();
            match self
                .manager
                .add_message_listener(self.forwarder(events::MESSAGE_CHANGE), name.clone())
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    warn!(instance = %name, %error, "failed to add message listener");
                    continue;
                }
            }
            match self
                .manager
                .add_current_state_listener(
                    self.forwarder(events::CURRENT_STATE_CHANGE),
                    name.clone(),
                    session,
                )
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    warn!(instance = %name, %error, "failed to add current-state listener");
                }
            }
            debug!(instance = %name, %session, "tracking instance");
            tracked.insert(name, (session, handles));
        }
    }

    async fn read_live_instances(&self) -> Result<HashMap<String, SessionId>> {
        let store = self.manager.store();
        let paths = self.manager.paths();
        let mut live = HashMap::new();
        for name in store
            .children(&paths.live_instances())
            .await
            .map_err(FlockError::Store)?
        {
            let path = paths.live_instance(&name);
            if let Some(record) = store.read(&path).await.map_err(FlockError::Store)? {
                let instance: LiveInstance =
                    model::decode(&path, record.data).map_err(FlockError::Store)?;
                live.insert(instance.instance, instance.session);
            }
        }
        Ok(live)
    }

    async fn run_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ClusterEvent>,
        mut leader_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *leader_rx.borrow() {
                        info!("assumed controller duties, scheduling full rebalance");
                        let _ = self.event_tx.send(ClusterEvent::new(events::PERIODIC_REBALANCE));
                    }
                }
                received = rx.recv() => {
                    let Some(first) = received else { break };
                    // Coalesce the burst: one run per distinct event name,
                    // in first-seen order. Runs re-read the store, so the
                    // dropped duplicates lose nothing.
                    let mut names: Vec<String> = vec![first.name().to_string()];
                    while let Ok(next) = rx.try_recv() {
                        if !names.iter().any(|n| n == next.name()) {
                            names.push(next.name().to_string());
                        }
                    }
                    if names.iter().any(|n| {
                        n == events::LIVE_INSTANCE_CHANGE || n == events::PERIODIC_REBALANCE
                    }) {
                        self.sync_instance_listeners().await;
                    }
                    if !self.manager.is_leader() {
                        debug!(events = names.len(), "not leader, discarding coalesced events");
                        continue;
                    }
                    let Some(session) = self.manager.session_id() else { continue };
                    for name in names {
                        self.run_pipelines(&name, session, &leader_rx).await;
                    }
                }
            }
        }
    }

    async fn run_pipelines(
        &self,
        event_name: &str,
        session: SessionId,
        leader_rx: &watch::Receiver<bool>,
    ) {
        for pipeline in self.registry.pipelines_for(event_name) {
            let mut event = ClusterEvent::new(event_name);
            event.set_attribute(attributes::SESSION, session);
            let outcome = pipeline.lock().await.run(&mut event, Some(leader_rx)).await;
            match outcome {
                Ok(()) => {}
                Err(StageError::Aborted { stage }) => {
                    warn!(event = event_name, stage, "pipeline run aborted on leadership loss");
                }
                Err(failure) => {
                    // One failed run never poisons the controller; the next
                    // triggering event re-runs from fresh store state.
                    error!(event = event_name, %failure, "pipeline run failed");
                }
            }
        }
    }
}

/// Controller runtime attached to a connected controller-role manager.
pub struct GenericController {
    inner: Arc<ControllerInner>,
}

impl GenericController {
    /// The standard pipeline set: a resource pipeline (read -> current ->
    /// best-possible -> generate -> dispatch) and an external-view pipeline,
    /// both triggered by every placement-relevant event.
    pub fn default_registry() -> PipelineRegistry {
        let resource = Arc::new(tokio::sync::Mutex::new(
            Pipeline::new("resource")
                .with_stage(Box::new(ReadClusterDataStage::new()))
                .with_stage(Box::new(CurrentStateStage::new()))
                .with_stage(Box::new(BestPossibleStateStage::new()))
                .with_stage(Box::new(MessageGenerationStage::new()))
                .with_stage(Box::new(MessageDispatchStage::new())),
        ));
        let external_view = Arc::new(tokio::sync::Mutex::new(
            Pipeline::new("external_view")
                .with_stage(Box::new(ReadClusterDataStage::new()))
                .with_stage(Box::new(ExternalViewStage::new())),
        ));

        let mut registry = PipelineRegistry::new();
        for event_name in [
            events::IDEAL_STATE_CHANGE,
            events::CONFIG_CHANGE,
            events::LIVE_INSTANCE_CHANGE,
            events::CURRENT_STATE_CHANGE,
            events::MESSAGE_CHANGE,
            events::PERIODIC_REBALANCE,
        ] {
            registry.register(event_name, resource.clone());
        }
        for event_name in [
            events::LIVE_INSTANCE_CHANGE,
            events::CURRENT_STATE_CHANGE,
            events::IDEAL_STATE_CHANGE,
            events::PERIODIC_REBALANCE,
        ] {
            registry.register(event_name, external_view.clone());
        }
        registry
    }

    /// Start a controller with the standard pipelines.
    pub async fn start(manager: ClusterManager) -> Result<Self> {
        Self::start_with(manager, Self::default_registry(), StateModelDefRegistry::new()).await
    }

    /// Start a controller with a custom pipeline registry and state model
    /// definitions.
    pub async fn start_with(
        manager: ClusterManager,
        registry: PipelineRegistry,
        defs: StateModelDefRegistry,
    ) -> Result<Self> {
        if manager.instance_type() != InstanceType::Controller {
            return Err(FlockError::Configuration(format!(
                "controller requires a controller-role manager, got {}",
                manager.instance_type()
            )));
        }
        if !manager.is_connected() {
            return Err(FlockError::Manager(crate::manager::ManagerError::NotConnected));
        }

        let context = StageContext {
            cluster: manager.cluster_name().to_string(),
            instance: manager.instance_name().to_string(),
            store: manager.store(),
            paths: manager.paths().clone(),
            config: manager.config().clone(),
            state_model_defs: defs.clone(),
        };
        registry.init_all(&context).await;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            manager: manager.clone(),
            registry,
            defs,
            event_tx,
            instance_listeners: tokio::sync::Mutex::new(HashMap::new()),
            forwarder_handles: tokio::sync::Mutex::new(Vec::new()),
            runner: parking_lot::Mutex::new(None),
        });

        let leader_rx = manager.leadership_changes();
        let runner = tokio::spawn(inner.clone().run_loop(event_rx, leader_rx));
        *inner.runner.lock() = Some(runner);

        // Cluster-wide listeners; each INIT seeds one event so a freshly
        // elected controller converges without waiting for a change.
        {
            let mut handles = inner.forwarder_handles.lock().await;
            handles.push(
                manager
                    .add_ideal_state_listener(inner.forwarder(events::IDEAL_STATE_CHANGE))
                    .await?,
            );
            handles.push(
                manager
                    .add_instance_config_listener(inner.forwarder(events::CONFIG_CHANGE))
                    .await?,
            );
            handles.push(
                manager
                    .add_live_instance_listener(inner.forwarder(events::LIVE_INSTANCE_CHANGE))
                    .await?,
            );
        }

        // Leader-only cadence: periodic rebalance sweeps up anything a lost
        // notification missed.
        let tick_tx = inner.event_tx.clone();
        manager.add_timer_task(
            "periodic_rebalance",
            Duration::from_millis(manager.config().pipeline.periodic_rebalance_interval_ms),
            move || {
                let _ = tick_tx.send(ClusterEvent::new(events::PERIODIC_REBALANCE));
            },
        );
        if manager.is_leader() {
            // Leadership arrived before the timer task existed; restart the
            // (idempotent) timer set so the new task is picked up.
            manager.stop_timer_tasks();
            manager.start_timer_tasks();
        }

        info!(cluster = %manager.cluster_name(), instance = %manager.instance_name(), "controller started");
        Ok(Self { inner })
    }

    /// Register a custom state model definition for message generation.
    pub fn register_state_model_def(&self, def: Arc<crate::participant::StateModelDef>) {
        self.inner.defs.register(def);
    }

    /// Stop the controller: abort the runner, release stages, and remove
    /// this controller's listeners.
    pub async fn stop(&self) {
        if let Some(runner) = self.inner.runner.lock().take() {
            runner.abort();
        }
        self.inner.registry.release_all().await;

        let mut handles = self.inner.forwarder_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = self.inner.manager.remove_listener(handle).await;
        }
        drop(handles);
        let mut tracked = self.inner.instance_listeners.lock().await;
        for (_, (_, instance_handles)) in tracked.drain() {
            for handle in instance_handles {
                let _ = self.inner.manager.remove_listener(handle).await;
            }
        }
        info!("controller stopped");
    }
}
