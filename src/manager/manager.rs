//! The cluster manager: one explicit value owning a store connection, its
//! session, its listener registrations, and (for controllers) the leadership
//! campaign. Constructed, connected, used, disconnected; never reused across
//! sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionState, InstanceType};
use super::leadership;
use super::listeners::{
    empty_notification, ChangeNotification, ChangeScope, ClusterChangeListener, ListenerHandle,
    ListenerRegistry, NotificationContext, NotificationType,
};
use super::{ManagerError, ManagerResult};
use crate::config::FlockConfig;
use crate::metadata::{
    ClusterPaths, CreateMode, MetadataStore, SessionEvent, SessionId, StoreError, StoreResult,
    SubtreeWatch,
};
use crate::model::{
    self, CurrentState, ExternalView, IdealState, InstanceConfig, LiveInstance, Message,
};

/// Invoked before the manager publishes itself to the cluster, so callers
/// can finish local setup (e.g. register state model factories) first.
#[async_trait]
pub trait PreConnectCallback: Send + Sync {
    async fn on_pre_connect(&self);
}

type TimerTick = Arc<dyn Fn() + Send + Sync>;

struct TimerTaskDef {
    name: String,
    period: Duration,
    tick: TimerTick,
}

/// Leader-only periodic tasks, started on leadership acquisition and
/// stopped on loss. Both operations are idempotent.
struct TimerTasks {
    defs: Mutex<Vec<TimerTaskDef>>,
    running: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TimerTasks {
    fn new() -> Self {
        Self {
            defs: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut running = self.running.lock();
        for def in self.defs.lock().iter() {
            let tick = def.tick.clone();
            let period = def.period;
            let name = def.name.clone();
            running.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick of tokio's interval completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    debug!(task = %name, "timer task tick");
                    tick();
                }
            }));
        }
    }

    fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.running.lock().drain(..) {
            task.abort();
        }
    }
}

pub(crate) struct ManagerInner {
    cluster: String,
    instance_name: String,
    instance_type: InstanceType,
    store: Arc<dyn MetadataStore>,
    paths: ClusterPaths,
    config: FlockConfig,
    lifecycle: tokio::sync::Mutex<ConnectionState>,
    session: parking_lot::RwLock<Option<SessionId>>,
    connected: AtomicBool,
    leader: AtomicBool,
    leader_tx: watch::Sender<bool>,
    listeners: ListenerRegistry,
    timers: TimerTasks,
    pre_connect: Mutex<Vec<Arc<dyn PreConnectCallback>>>,
    last_notification: Mutex<Option<DateTime<Utc>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    pub(crate) fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub(crate) fn paths(&self) -> &ClusterPaths {
        &self.paths
    }

    pub(crate) fn config(&self) -> &FlockConfig {
        &self.config
    }

    pub(crate) fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub(crate) fn current_session(&self) -> Option<SessionId> {
        *self.session.read()
    }

    fn notification_context(&self, notification_type: NotificationType) -> NotificationContext {
        NotificationContext {
            notification_type,
            cluster: self.cluster.clone(),
            session: self.current_session(),
            at: Utc::now(),
        }
    }

    fn touch_notification_time(&self) {
        *self.last_notification.lock() = Some(Utc::now());
    }

    pub(crate) fn on_leadership_acquired(&self) {
        if !self.leader.swap(true, Ordering::SeqCst) {
            info!(cluster = %self.cluster, instance = %self.instance_name, "acquired leadership");
            let _ = self.leader_tx.send(true);
            self.timers.start();
        }
    }

    pub(crate) fn on_leadership_lost(&self) {
        if self.leader.swap(false, Ordering::SeqCst) {
            warn!(cluster = %self.cluster, instance = %self.instance_name, "lost leadership");
            self.timers.stop();
            let _ = self.leader_tx.send(false);
        }
    }

    /// Open a session, retrying transient connection failures with
    /// exponential backoff up to the configured attempt budget.
    async fn establish_session(&self) -> ManagerResult<SessionId> {
        let limit = self.config.connection.connect_retry_limit.max(1);
        let mut attempt = 0u32;
        loop {
            match self.store.create_session().await {
                Ok(session) => return Ok(session),
                Err(StoreError::Connection { .. }) if attempt + 1 < limit => {
                    let delay = self.config.backoff_delay_ms(attempt);
                    warn!(attempt, delay_ms = delay, "store unreachable, retrying connect");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ManagerError::ConnectionFailed {
                        attempts: attempt + 1,
                        source,
                    })
                }
            }
        }
    }

    /// Publish role-specific presence for a fresh session.
    async fn setup_role(self: &Arc<Self>, session: SessionId) -> ManagerResult<()> {
        match self.instance_type {
            InstanceType::Participant => {
                let live = LiveInstance::new(self.instance_name.clone(), session);
                let data = model::encode(&live)?;
                self.store
                    .create(
                        &self.paths.live_instance(&self.instance_name),
                        data,
                        CreateMode::Ephemeral,
                        session,
                    )
                    .await?;
                info!(instance = %self.instance_name, %session, "published live instance");
            }
            InstanceType::Controller => {
                let inner = self.clone();
                let handle = tokio::spawn(leadership::campaign(inner, session));
                self.background.lock().push(handle);
            }
            InstanceType::Spectator => {}
        }
        Ok(())
    }

    fn spawn_session_supervisor(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Expired(expired)) => {
                        if inner.current_session() == Some(expired) {
                            inner.handle_session_expiry(expired).await;
                        }
                    }
                    Ok(SessionEvent::Closed(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.background.lock().push(handle);
    }

    /// Session expiry is an implicit disconnect plus the manager's own
    /// reconnect: FINALIZE every listener, establish a new session, and
    /// re-register everything (fresh INIT per listener).
    async fn handle_session_expiry(self: &Arc<Self>, expired: SessionId) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if *lifecycle != ConnectionState::Connected {
                return;
            }
            *lifecycle = ConnectionState::SessionExpired;
        }
        warn!(cluster = %self.cluster, instance = %self.instance_name, session = %expired,
            "session expired, entering recovery");
        self.connected.store(false, Ordering::SeqCst);
        self.on_leadership_lost();

        let suspended = self.listeners.suspend_all().await;
        let finalize_ctx = NotificationContext {
            notification_type: NotificationType::Finalize,
            cluster: self.cluster.clone(),
            session: Some(expired),
            at: Utc::now(),
        };
        for (_, scope, listener) in &suspended {
            listener
                .on_change(empty_notification(scope), &finalize_ctx)
                .await;
        }

        {
            let mut lifecycle = self.lifecycle.lock().await;
            *lifecycle = ConnectionState::Connecting;
        }
        match self.establish_session().await {
            Ok(new_session) => {
                self.session.write().replace(new_session);
                self.connected.store(true, Ordering::SeqCst);
                *self.lifecycle.lock().await = ConnectionState::Connected;
                if let Err(error) = self.setup_role(new_session).await {
                    error!(%error, "failed to re-publish role after session recovery");
                }
                for (id, scope, listener) in suspended {
                    if let Err(error) = self
                        .start_listener(id, scope.clone(), listener, new_session)
                        .await
                    {
                        error!(%error, ?scope, "failed to re-register listener after recovery");
                    }
                }
                info!(session = %new_session, "session re-established");
            }
            Err(error) => {
                error!(%error, "could not re-establish session; manager is terminated");
                *self.lifecycle.lock().await = ConnectionState::Terminated;
            }
        }
    }

    /// Arm the watch, deliver INIT synchronously, then hand the armed watch
    /// to the dispatch loop. Arming before the INIT read means no change can
    /// fall between the seed snapshot and the first CALLBACK.
    async fn start_listener(
        self: &Arc<Self>,
        id: u64,
        scope: ChangeScope,
        listener: Arc<dyn ClusterChangeListener>,
        session: SessionId,
    ) -> ManagerResult<()> {
        let prefix = self.scope_prefix(&scope);
        let initial_watch = self.store.watch_subtree(&prefix).await?;
        let seed = self.read_scope_data(&scope).await?;
        let ctx = self.notification_context(NotificationType::Init);
        listener.on_change(seed, &ctx).await;
        self.touch_notification_time();

        let inner = self.clone();
        let task_listener = listener.clone();
        let task_scope = scope.clone();
        let task = tokio::spawn(async move {
            inner
                .listener_watch_loop(task_scope, task_listener, session, initial_watch)
                .await;
        });
        self.listeners.set_watch_task(id, task).await;
        Ok(())
    }

    async fn listener_watch_loop(
        self: Arc<Self>,
        scope: ChangeScope,
        listener: Arc<dyn ClusterChangeListener>,
        session: SessionId,
        mut watch: SubtreeWatch,
    ) {
        loop {
            let Some(event) = watch.fired().await else {
                break;
            };
            // Re-arm before reading so changes made while we process this
            // firing produce another firing instead of being lost.
            let next = match self.store.rearm(event.token).await {
                Ok(next) => next,
                Err(_) => break,
            };
            if self.current_session() != Some(session) {
                break;
            }
            match self.read_scope_data(&scope).await {
                Ok(change) => {
                    let ctx = self.notification_context(NotificationType::Callback);
                    listener.on_change(change, &ctx).await;
                    self.touch_notification_time();
                }
                Err(error) => {
                    warn!(%error, ?scope, path = %event.path, "failed to read change data");
                }
            }
            watch = next;
        }
    }

    fn scope_prefix(&self, scope: &ChangeScope) -> String {
        match scope {
            ChangeScope::IdealStates => self.paths.ideal_states(),
            ChangeScope::InstanceConfigs => self.paths.configs(),
            ChangeScope::LiveInstances => self.paths.live_instances(),
            ChangeScope::ExternalViews => self.paths.external_views(),
            ChangeScope::Controller => self.paths.controller(),
            ChangeScope::Messages { instance } => self.paths.messages(instance),
            ChangeScope::CurrentStates { instance, session } => {
                self.paths.current_states(instance, *session)
            }
        }
    }

    /// Current store contents for a scope; always a fresh read.
    async fn read_scope_data(&self, scope: &ChangeScope) -> StoreResult<ChangeNotification> {
        match scope {
            ChangeScope::IdealStates => {
                let records: Vec<IdealState> = self.read_children(&self.paths.ideal_states()).await?;
                Ok(ChangeNotification::IdealStates(records))
            }
            ChangeScope::InstanceConfigs => {
                let records: Vec<InstanceConfig> = self.read_children(&self.paths.configs()).await?;
                Ok(ChangeNotification::InstanceConfigs(records))
            }
            ChangeScope::LiveInstances => {
                let records: Vec<LiveInstance> =
                    self.read_children(&self.paths.live_instances()).await?;
                Ok(ChangeNotification::LiveInstances(records))
            }
            ChangeScope::ExternalViews => {
                let records: Vec<ExternalView> =
                    self.read_children(&self.paths.external_views()).await?;
                Ok(ChangeNotification::ExternalViews(records))
            }
            ChangeScope::Controller => {
                let leader = match self.store.read(&self.paths.leader()).await? {
                    Some(record) => {
                        let leader: leadership::LeaderRecord =
                            model::decode(&self.paths.leader(), record.data)?;
                        Some(leader.instance)
                    }
                    None => None,
                };
                Ok(ChangeNotification::Controller { leader })
            }
            ChangeScope::Messages { instance } => {
                let messages: Vec<Message> = self.read_children(&self.paths.messages(instance)).await?;
                Ok(ChangeNotification::Messages {
                    instance: instance.clone(),
                    messages,
                })
            }
            ChangeScope::CurrentStates { instance, session } => {
                let states: Vec<CurrentState> = self
                    .read_children(&self.paths.current_states(instance, *session))
                    .await?;
                Ok(ChangeNotification::CurrentStates {
                    instance: instance.clone(),
                    states,
                })
            }
        }
    }

    async fn read_children<T: serde::de::DeserializeOwned>(
        &self,
        parent: &str,
    ) -> StoreResult<Vec<T>> {
        let mut records = Vec::new();
        for child in self.store.children(parent).await? {
            let path = format!("{parent}/{child}");
            if let Some(record) = self.store.read(&path).await? {
                records.push(model::decode(&path, record.data)?);
            }
        }
        Ok(records)
    }
}

/// First-class object any process uses to interact with the cluster.
///
/// General flow: construct for a role, `connect()`, add listeners, react to
/// INIT/CALLBACK/FINALIZE notifications, `disconnect()`. Cheap to clone;
/// clones share the same underlying connection.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

impl ClusterManager {
    pub fn new(
        cluster: impl Into<String>,
        instance_name: impl Into<String>,
        instance_type: InstanceType,
        store: Arc<dyn MetadataStore>,
        config: FlockConfig,
    ) -> Self {
        let cluster = cluster.into();
        let (leader_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                paths: ClusterPaths::new(cluster.clone()),
                cluster,
                instance_name: instance_name.into(),
                instance_type,
                store,
                config,
                lifecycle: tokio::sync::Mutex::new(ConnectionState::Disconnected),
                session: parking_lot::RwLock::new(None),
                connected: AtomicBool::new(false),
                leader: AtomicBool::new(false),
                leader_tx,
                listeners: ListenerRegistry::new(),
                timers: TimerTasks::new(),
                pre_connect: Mutex::new(Vec::new()),
                last_notification: Mutex::new(None),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.inner.cluster
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }

    pub fn instance_type(&self) -> InstanceType {
        self.inner.instance_type
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.inner.store.clone()
    }

    pub fn paths(&self) -> &ClusterPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &FlockConfig {
        &self.inner.config
    }

    /// Session of the current connection epoch, if connected.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.current_session()
    }

    /// Timestamp of the most recent notification delivered to any listener.
    pub fn last_notification_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_notification.lock()
    }

    /// Register a callback to run before the manager publishes itself.
    pub fn add_pre_connect_callback(&self, callback: Arc<dyn PreConnectCallback>) {
        self.inner.pre_connect.lock().push(callback);
    }

    /// Register a leader-only periodic task. Takes effect on the next
    /// leadership acquisition.
    pub fn add_timer_task(
        &self,
        name: impl Into<String>,
        period: Duration,
        tick: impl Fn() + Send + Sync + 'static,
    ) {
        self.inner.timers.defs.lock().push(TimerTaskDef {
            name: name.into(),
            period,
            tick: Arc::new(tick),
        });
    }

    /// Start leader-only timer tasks. Idempotent; invoked automatically on
    /// leadership acquisition.
    pub fn start_timer_tasks(&self) {
        self.inner.timers.start();
    }

    /// Stop leader-only timer tasks. Idempotent; invoked automatically on
    /// leadership loss.
    pub fn stop_timer_tasks(&self) {
        self.inner.timers.stop();
    }

    /// Establish the session and publish this process to the cluster.
    /// Not re-entrant: a second call fails with `AlreadyConnected`.
    pub async fn connect(&self) -> ManagerResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            match *lifecycle {
                ConnectionState::Disconnected => {}
                ConnectionState::Terminated => return Err(ManagerError::Terminated),
                _ => return Err(ManagerError::AlreadyConnected),
            }
            *lifecycle = ConnectionState::Connecting;
        }

        let callbacks: Vec<_> = self.inner.pre_connect.lock().clone();
        for callback in callbacks {
            callback.on_pre_connect().await;
        }

        // Subscribe before the session exists so an expiry immediately after
        // connect cannot slip past the supervisor.
        let session_events = self.inner.store.session_events();
        let session = match self.inner.establish_session().await {
            Ok(session) => session,
            Err(error) => {
                *self.inner.lifecycle.lock().await = ConnectionState::Disconnected;
                return Err(error);
            }
        };
        self.inner.session.write().replace(session);
        self.inner.connected.store(true, Ordering::SeqCst);
        *self.inner.lifecycle.lock().await = ConnectionState::Connected;

        if let Err(error) = self.inner.setup_role(session).await {
            // Roll back so the caller can retry with a fresh manager.
            self.inner.connected.store(false, Ordering::SeqCst);
            let _ = self.inner.store.close_session(session).await;
            *self.inner.lifecycle.lock().await = ConnectionState::Terminated;
            return Err(error);
        }
        self.inner.spawn_session_supervisor(session_events);
        info!(
            cluster = %self.inner.cluster,
            instance = %self.inner.instance_name,
            kind = %self.inner.instance_type,
            %session,
            "connected"
        );
        Ok(())
    }

    /// Liveness probe; gate all store interaction on this.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether this process currently holds the leadership marker.
    pub fn is_leader(&self) -> bool {
        self.is_connected() && self.inner.leader.load(Ordering::SeqCst)
    }

    /// Observe leadership acquisition/loss. The receiver holds `true` while
    /// this manager leads.
    pub fn leadership_changes(&self) -> watch::Receiver<bool> {
        self.inner.leader_tx.subscribe()
    }

    pub async fn current_lifecycle(&self) -> ConnectionState {
        *self.inner.lifecycle.lock().await
    }

    /// Register interest in a change category. Delivers one synchronous
    /// INIT, then CALLBACKs in store-observation order until removal.
    pub async fn add_listener(
        &self,
        scope: ChangeScope,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> ManagerResult<ListenerHandle> {
        if !self.is_connected() {
            return Err(ManagerError::NotConnected);
        }
        let session = self
            .inner
            .current_session()
            .ok_or(ManagerError::NotConnected)?;
        let id = self.inner.listeners.add(scope.clone(), listener.clone()).await;
        self.inner
            .start_listener(id, scope, listener, session)
            .await?;
        Ok(ListenerHandle(id))
    }

    pub async fn add_ideal_state_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(ChangeScope::IdealStates, listener).await
    }

    pub async fn add_instance_config_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(ChangeScope::InstanceConfigs, listener).await
    }

    pub async fn add_live_instance_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(ChangeScope::LiveInstances, listener).await
    }

    pub async fn add_external_view_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(ChangeScope::ExternalViews, listener).await
    }

    pub async fn add_controller_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(ChangeScope::Controller, listener).await
    }

    pub async fn add_message_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
        instance: impl Into<String>,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(
            ChangeScope::Messages {
                instance: instance.into(),
            },
            listener,
        )
        .await
    }

    pub async fn add_current_state_listener(
        &self,
        listener: Arc<dyn ClusterChangeListener>,
        instance: impl Into<String>,
        session: SessionId,
    ) -> ManagerResult<ListenerHandle> {
        self.add_listener(
            ChangeScope::CurrentStates {
                instance: instance.into(),
                session,
            },
            listener,
        )
        .await
    }

    /// Deregister a listener, delivering exactly one FINALIZE. Returns
    /// `false` if the handle was already removed.
    pub async fn remove_listener(&self, handle: ListenerHandle) -> ManagerResult<bool> {
        let Some(mut entry) = self.inner.listeners.remove(handle.0).await else {
            return Ok(false);
        };
        entry.abort_watch();
        let ctx = self.inner.notification_context(NotificationType::Finalize);
        entry
            .listener
            .on_change(empty_notification(&entry.scope), &ctx)
            .await;
        Ok(true)
    }

    /// Tear down the connection: FINALIZE every remaining listener, remove
    /// this session's ephemeral nodes, and terminate the manager. A new
    /// manager instance is required to connect again.
    pub async fn disconnect(&self) -> ManagerResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match *lifecycle {
            ConnectionState::Connected | ConnectionState::SessionExpired => {}
            ConnectionState::Terminated => return Err(ManagerError::Terminated),
            _ => return Err(ManagerError::NotConnected),
        }

        self.inner.on_leadership_lost();
        self.inner.connected.store(false, Ordering::SeqCst);

        let mut entries = self.inner.listeners.drain().await;
        let ctx = NotificationContext {
            notification_type: NotificationType::Finalize,
            cluster: self.inner.cluster.clone(),
            session: self.inner.current_session(),
            at: Utc::now(),
        };
        for entry in &mut entries {
            entry.abort_watch();
            entry
                .listener
                .on_change(empty_notification(&entry.scope), &ctx)
                .await;
        }

        for task in self.inner.background.lock().drain(..) {
            task.abort();
        }

        if let Some(session) = self.inner.session.write().take() {
            if let Err(error) = self.inner.store.close_session(session).await {
                warn!(%error, "failed to close session cleanly");
            }
        }
        *lifecycle = ConnectionState::Terminated;
        info!(cluster = %self.inner.cluster, instance = %self.inner.instance_name, "disconnected");
        Ok(())
    }
}
