//! Store-path layout for one cluster.
//!
//! All persisted records live under `/{cluster}`:
//!
//! ```text
//! /{cluster}/CONFIGS/{instance}
//! /{cluster}/LIVE_INSTANCES/{instance}                        (ephemeral)
//! /{cluster}/IDEAL_STATES/{resource}
//! /{cluster}/EXTERNAL_VIEW/{resource}
//! /{cluster}/INSTANCES/{instance}/CURRENT_STATE/{session}/{resource}
//! /{cluster}/INSTANCES/{instance}/MESSAGES/{msg_id}
//! /{cluster}/INSTANCES/{instance}/ERRORS/{msg_id}
//! /{cluster}/CONTROLLER/LEADER                                (ephemeral)
//! ```

use crate::constants::paths as seg;
use crate::metadata::store::SessionId;

#[derive(Debug, Clone)]
pub struct ClusterPaths {
    cluster: String,
}

impl ClusterPaths {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn root(&self) -> String {
        format!("/{}", self.cluster)
    }

    pub fn configs(&self) -> String {
        format!("/{}/{}", self.cluster, seg::CONFIGS)
    }

    pub fn config(&self, instance: &str) -> String {
        format!("{}/{}", self.configs(), instance)
    }

    pub fn live_instances(&self) -> String {
        format!("/{}/{}", self.cluster, seg::LIVE_INSTANCES)
    }

    pub fn live_instance(&self, instance: &str) -> String {
        format!("{}/{}", self.live_instances(), instance)
    }

    pub fn ideal_states(&self) -> String {
        format!("/{}/{}", self.cluster, seg::IDEAL_STATES)
    }

    pub fn ideal_state(&self, resource: &str) -> String {
        format!("{}/{}", self.ideal_states(), resource)
    }

    pub fn external_views(&self) -> String {
        format!("/{}/{}", self.cluster, seg::EXTERNAL_VIEW)
    }

    pub fn external_view(&self, resource: &str) -> String {
        format!("{}/{}", self.external_views(), resource)
    }

    pub fn instance(&self, instance: &str) -> String {
        format!("/{}/{}/{}", self.cluster, seg::INSTANCES, instance)
    }

    pub fn current_states(&self, instance: &str, session: SessionId) -> String {
        format!("{}/{}/{}", self.instance(instance), seg::CURRENT_STATE, session)
    }

    pub fn current_state(&self, instance: &str, session: SessionId, resource: &str) -> String {
        format!("{}/{}", self.current_states(instance, session), resource)
    }

    pub fn messages(&self, instance: &str) -> String {
        format!("{}/{}", self.instance(instance), seg::MESSAGES)
    }

    pub fn message(&self, instance: &str, id: &str) -> String {
        format!("{}/{}", self.messages(instance), id)
    }

    pub fn errors(&self, instance: &str) -> String {
        format!("{}/{}", self.instance(instance), seg::ERRORS)
    }

    pub fn error(&self, instance: &str, id: &str) -> String {
        format!("{}/{}", self.errors(instance), id)
    }

    pub fn controller(&self) -> String {
        format!("/{}/{}", self.cluster, seg::CONTROLLER)
    }

    pub fn leader(&self) -> String {
        format!("{}/{}", self.controller(), seg::LEADER)
    }
}
