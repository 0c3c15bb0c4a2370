//! First stage of every pipeline: refresh the cluster data cache.

use async_trait::async_trait;

use crate::controller::cluster_data::ClusterDataCache;
use crate::controller::event::{attributes, ClusterEvent};
use crate::controller::stage::{Stage, StageContext, StageError, StageResult};

#[derive(Default)]
pub struct ReadClusterDataStage {
    context: Option<StageContext>,
}

impl ReadClusterDataStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for ReadClusterDataStage {
    fn name(&self) -> &'static str {
        "ReadClusterData"
    }

    async fn init(&mut self, context: StageContext) {
        self.context = Some(context);
    }

    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()> {
        let context = self.context.as_ref().ok_or(StageError::NotInitialized {
            stage: self.name(),
        })?;
        let cache = ClusterDataCache::refresh(context.store.as_ref(), &context.paths).await?;
        tracing::debug!(
            live_instances = cache.live_instances.len(),
            resources = cache.ideal_states.len(),
            "cluster data refreshed"
        );
        event.set_attribute(attributes::CLUSTER_DATA, cache);
        Ok(())
    }
}
