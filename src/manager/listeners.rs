//! Listener protocol: change categories, notification kinds, and the
//! registry tracking each registration with its watch-dispatch task.
//!
//! Delivery contract: one synchronous INIT at registration, CALLBACKs in
//! store-observation order per listener (no cross-listener ordering), and
//! exactly one FINALIZE at removal, disconnect, or session expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::metadata::SessionId;
use crate::model::{
    CurrentState, ExternalView, IdealState, InstanceConfig, LiveInstance, Message,
};

/// Why a notification is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    /// First delivery after registration; seeds the listener's state.
    Init,
    /// A relevant change was observed in the store.
    Callback,
    /// The registration (or its session) is ending; payload data is not
    /// reliable.
    Finalize,
}

/// Context handed to every listener invocation.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub notification_type: NotificationType,
    pub cluster: String,
    /// Session the delivering manager holds, if connected.
    pub session: Option<SessionId>,
    pub at: DateTime<Utc>,
}

/// The change category a listener subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    IdealStates,
    InstanceConfigs,
    LiveInstances,
    ExternalViews,
    /// Leadership marker changes.
    Controller,
    /// Messages addressed to one instance.
    Messages { instance: String },
    /// Current states reported by one instance under one of its sessions.
    CurrentStates {
        instance: String,
        session: SessionId,
    },
}

/// Typed payload delivered to listeners, re-read from the store at delivery
/// time rather than trusting the triggering event.
#[derive(Debug, Clone)]
pub enum ChangeNotification {
    IdealStates(Vec<IdealState>),
    InstanceConfigs(Vec<InstanceConfig>),
    LiveInstances(Vec<LiveInstance>),
    ExternalViews(Vec<ExternalView>),
    Controller { leader: Option<String> },
    Messages {
        instance: String,
        messages: Vec<Message>,
    },
    CurrentStates {
        instance: String,
        states: Vec<CurrentState>,
    },
}

/// Payload shell for FINALIZE deliveries, where data is unreliable.
pub(crate) fn empty_notification(scope: &ChangeScope) -> ChangeNotification {
    match scope {
        ChangeScope::IdealStates => ChangeNotification::IdealStates(Vec::new()),
        ChangeScope::InstanceConfigs => ChangeNotification::InstanceConfigs(Vec::new()),
        ChangeScope::LiveInstances => ChangeNotification::LiveInstances(Vec::new()),
        ChangeScope::ExternalViews => ChangeNotification::ExternalViews(Vec::new()),
        ChangeScope::Controller => ChangeNotification::Controller { leader: None },
        ChangeScope::Messages { instance } => ChangeNotification::Messages {
            instance: instance.clone(),
            messages: Vec::new(),
        },
        ChangeScope::CurrentStates { instance, .. } => ChangeNotification::CurrentStates {
            instance: instance.clone(),
            states: Vec::new(),
        },
    }
}

/// Callback interface exposed to controller, participants, and external
/// collaborators (spectators, admin tools). Invoked from the manager's
/// watch-dispatch task; implementations must not block indefinitely.
#[async_trait]
pub trait ClusterChangeListener: Send + Sync {
    async fn on_change(&self, change: ChangeNotification, context: &NotificationContext);
}

/// Opaque handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(pub(crate) u64);

pub(crate) struct Registration {
    pub id: u64,
    pub scope: ChangeScope,
    pub listener: Arc<dyn ClusterChangeListener>,
    pub watch_task: Option<JoinHandle<()>>,
}

impl Registration {
    pub fn abort_watch(&mut self) {
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }
}

/// Registrations for one manager, scoped to its current session.
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: tokio::sync::Mutex<Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn add(
        &self,
        scope: ChangeScope,
        listener: Arc<dyn ClusterChangeListener>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().await.push(Registration {
            id,
            scope,
            listener,
            watch_task: None,
        });
        id
    }

    pub async fn set_watch_task(&self, id: u64, task: JoinHandle<()>) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.watch_task = Some(task);
        } else {
            // Registration was removed before the task was attached.
            task.abort();
        }
    }

    pub async fn remove(&self, id: u64) -> Option<Registration> {
        let mut entries = self.entries.lock().await;
        let idx = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(idx))
    }

    pub async fn drain(&self) -> Vec<Registration> {
        std::mem::take(&mut *self.entries.lock().await)
    }

    /// Abort every watch task, returning (id, scope, listener) for FINALIZE
    /// delivery and later re-registration.
    pub async fn suspend_all(&self) -> Vec<(u64, ChangeScope, Arc<dyn ClusterChangeListener>)> {
        let mut entries = self.entries.lock().await;
        entries
            .iter_mut()
            .map(|entry| {
                entry.abort_watch();
                (entry.id, entry.scope.clone(), entry.listener.clone())
            })
            .collect()
    }
}
