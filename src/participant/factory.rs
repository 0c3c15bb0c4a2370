//! State model factories.
//!
//! A factory produces exactly one model per (resource, partition) key on
//! first reference; the engine caches the instance for the life of the
//! participant process.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::state_model::{StateModel, StateModelDef};
use crate::model::PartitionKey;

pub trait StateModelFactory: Send + Sync {
    /// The definition every model from this factory follows.
    fn definition(&self) -> Arc<StateModelDef>;

    /// Build the model for one partition replica. Called at most once per
    /// key; the engine owns the returned instance afterwards.
    fn create(&self, key: &PartitionKey) -> StateModel;
}

/// Built-in OnlineOffline factory. The artificial transition latency exists
/// to exercise slow-handler behavior in tests; zero by default.
pub struct OnlineOfflineStateModelFactory {
    transition_delay: Duration,
}

impl OnlineOfflineStateModelFactory {
    pub fn new() -> Self {
        Self {
            transition_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(transition_delay: Duration) -> Self {
        Self { transition_delay }
    }
}

impl Default for OnlineOfflineStateModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StateModelFactory for OnlineOfflineStateModelFactory {
    fn definition(&self) -> Arc<StateModelDef> {
        StateModelDef::online_offline()
    }

    fn create(&self, key: &PartitionKey) -> StateModel {
        let delay = self.transition_delay;
        let edge = move |name: &'static str| {
            move |message: crate::model::Message, _context: crate::manager::NotificationContext| {
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    info!(
                        resource = %message.resource,
                        partition = %message.partition,
                        transition = name,
                        "online-offline transition"
                    );
                    Ok(())
                }
            }
        };
        info!(key = %key, "creating OnlineOffline state model");
        StateModel::builder(self.definition())
            .on_fn("OFFLINE", "ONLINE", edge("offline_to_online"))
            .on_fn("ONLINE", "OFFLINE", edge("online_to_offline"))
            .on_fn("OFFLINE", "DROPPED", edge("offline_to_dropped"))
            .on_fn("ERROR", "OFFLINE", edge("error_to_offline"))
            .on_fn("ERROR", "DROPPED", edge("error_to_dropped"))
            .build()
    }
}
