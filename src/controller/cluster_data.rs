//! Snapshot of cluster state read at the start of each pipeline run.
//!
//! The pipeline never trusts event payloads: every run refreshes this cache
//! from the store, which is what makes event coalescing and notification
//! loss safe.

use std::collections::HashMap;

use futures::future::try_join_all;

use crate::metadata::{ClusterPaths, MetadataStore, StoreError, StoreResult};
use crate::model::{self, CurrentState, IdealState, InstanceConfig, LiveInstance, Message};

#[derive(Debug, Clone, Default)]
pub struct ClusterDataCache {
    /// instance -> config
    pub instance_configs: HashMap<String, InstanceConfig>,
    /// instance -> live record (current session)
    pub live_instances: HashMap<String, LiveInstance>,
    /// resource -> ideal state
    pub ideal_states: HashMap<String, IdealState>,
    /// instance -> resource -> current state under the instance's live session
    pub current_states: HashMap<String, HashMap<String, CurrentState>>,
    /// instance -> queued messages
    pub messages: HashMap<String, Vec<Message>>,
}

impl ClusterDataCache {
    /// Read everything the pipeline needs in one pass.
    pub async fn refresh(
        store: &dyn MetadataStore,
        paths: &ClusterPaths,
    ) -> StoreResult<Self> {
        let mut cache = Self::default();

        for name in store.children(&paths.configs()).await? {
            let path = paths.config(&name);
            if let Some(record) = store.read(&path).await? {
                cache
                    .instance_configs
                    .insert(name.clone(), model::decode(&path, record.data)?);
            }
        }

        for name in store.children(&paths.live_instances()).await? {
            let path = paths.live_instance(&name);
            if let Some(record) = store.read(&path).await? {
                let live: LiveInstance = model::decode(&path, record.data)?;
                cache.live_instances.insert(name.clone(), live);
            }
        }

        for name in store.children(&paths.ideal_states()).await? {
            let path = paths.ideal_state(&name);
            if let Some(record) = store.read(&path).await? {
                cache
                    .ideal_states
                    .insert(name.clone(), model::decode(&path, record.data)?);
            }
        }

        // Current states count only under each instance's live session;
        // records from dead sessions are orphans awaiting cleanup. Per-
        // instance reads are independent, so they run concurrently.
        let current_reads = cache.live_instances.values().map(|live| {
            let parent = paths.current_states(&live.instance, live.session);
            let instance = live.instance.clone();
            async move {
                let mut per_resource = HashMap::new();
                for resource in store.children(&parent).await? {
                    let path = format!("{parent}/{resource}");
                    if let Some(record) = store.read(&path).await? {
                        per_resource.insert(resource.clone(), model::decode(&path, record.data)?);
                    }
                }
                Ok::<_, StoreError>((instance, per_resource))
            }
        });
        cache.current_states = try_join_all(current_reads).await?.into_iter().collect();

        let message_reads = cache.live_instances.values().map(|live| {
            let parent = paths.messages(&live.instance);
            let instance = live.instance.clone();
            async move {
                let mut messages = Vec::new();
                for id in store.children(&parent).await? {
                    let path = format!("{parent}/{id}");
                    if let Some(record) = store.read(&path).await? {
                        messages.push(model::decode(&path, record.data)?);
                    }
                }
                Ok::<_, StoreError>((instance, messages))
            }
        });
        cache.messages = try_join_all(message_reads).await?.into_iter().collect();

        Ok(cache)
    }

    /// Whether an instance is live and not administratively disabled.
    /// Instances with no config record default to enabled.
    pub fn is_assignable(&self, instance: &str) -> bool {
        self.live_instances.contains_key(instance)
            && self
                .instance_configs
                .get(instance)
                .map(|config| config.enabled)
                .unwrap_or(true)
    }

    pub fn current_state(&self, instance: &str, resource: &str) -> Option<&CurrentState> {
        self.current_states.get(instance)?.get(resource)
    }
}
