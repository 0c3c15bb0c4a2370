//! # Controller Pipeline
//!
//! The controller reacts to cluster-change notifications by running ordered
//! stage pipelines over a shared event context: read cluster data, project
//! current state, compute the best possible state, then generate and
//! dispatch transition messages. A separate pipeline maintains the external
//! view. All of it runs only while this process holds the leadership
//! marker.

pub mod cluster_data;
#[allow(clippy::module_inception)]
pub mod controller;
pub mod event;
pub mod pipeline;
pub mod stage;
pub mod stages;

pub use cluster_data::ClusterDataCache;
pub use controller::GenericController;
pub use event::{attributes, ClusterEvent};
pub use pipeline::{Pipeline, PipelineRegistry};
pub use stage::{Stage, StageContext, StageError, StageResult};

use std::sync::Arc;

use dashmap::DashMap;

use crate::participant::StateModelDef;

/// State model definitions known to the controller, keyed by name. The
/// message generator consults these for initial states and legal transition
/// paths. The built-in OnlineOffline definition is always present.
#[derive(Clone)]
pub struct StateModelDefRegistry {
    inner: Arc<DashMap<String, Arc<StateModelDef>>>,
}

impl Default for StateModelDefRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StateModelDefRegistry {
    pub fn new() -> Self {
        let registry = Self {
            inner: Arc::new(DashMap::new()),
        };
        registry.register(StateModelDef::online_offline());
        registry
    }

    pub fn register(&self, def: Arc<StateModelDef>) {
        self.inner.insert(def.name().to_string(), def);
    }

    pub fn get(&self, name: &str) -> Option<Arc<StateModelDef>> {
        self.inner.get(name).map(|entry| Arc::clone(entry.value()))
    }
}
