//! External-view pipeline stage: aggregate reported current states into the
//! per-resource snapshot spectators read.

use async_trait::async_trait;
use tracing::debug;

use crate::controller::cluster_data::ClusterDataCache;
use crate::controller::event::{attributes, ClusterEvent};
use crate::controller::stage::{Stage, StageContext, StageError, StageResult};
use crate::metadata::{SessionId, WriteExpectation};
use crate::model::{self, ExternalView};

pub struct ExternalViewStage {
    context: Option<StageContext>,
}

impl Default for ExternalViewStage {
    fn default() -> Self {
        Self { context: None }
    }
}

impl ExternalViewStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for ExternalViewStage {
    fn name(&self) -> &'static str {
        "ExternalViewCompute"
    }

    async fn init(&mut self, context: StageContext) {
        self.context = Some(context);
    }

    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()> {
        let context = self.context.as_ref().ok_or(StageError::NotInitialized {
            stage: self.name(),
        })?;
        let cache = event
            .attribute::<ClusterDataCache>(attributes::CLUSTER_DATA)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::CLUSTER_DATA,
            })?;
        let session = *event
            .attribute::<SessionId>(attributes::SESSION)
            .ok_or(StageError::MissingAttribute {
                stage: self.name(),
                attribute: attributes::SESSION,
            })?;

        for resource in cache.ideal_states.keys() {
            let mut view = ExternalView::new(resource.clone());
            for (instance, per_resource) in &cache.current_states {
                if let Some(current) = per_resource.get(resource) {
                    for (partition, state) in &current.partitions {
                        view.record(partition.clone(), instance.clone(), state.clone());
                    }
                }
            }

            let path = context.paths.external_view(resource);
            let unchanged = match context.store.read(&path).await? {
                Some(record) => {
                    model::decode::<ExternalView>(&path, record.data).ok() == Some(view.clone())
                }
                None => false,
            };
            if unchanged {
                continue;
            }
            debug!(resource = %resource, "external view updated");
            context
                .store
                .write(&path, model::encode(&view)?, WriteExpectation::Any, session)
                .await?;
        }

        // Views for resources that no longer exist are removed so
        // spectators do not read ghosts.
        for orphan in context.store.children(&context.paths.external_views()).await? {
            if !cache.ideal_states.contains_key(&orphan) {
                context
                    .store
                    .delete(&context.paths.external_view(&orphan))
                    .await?;
            }
        }
        Ok(())
    }
}
