//! Pipeline runner and the event-name registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::event::ClusterEvent;
use super::stage::{Stage, StageContext, StageError, StageResult};

/// An ordered list of stages run against one event at a time. Ordering is
/// fixed at construction; stage N+1 never starts before stage N's
/// `post_process` returns.
pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn init(&mut self, context: &StageContext) {
        for stage in &mut self.stages {
            stage.init(context.clone()).await;
        }
    }

    /// Run every stage in order against the event. A stage failure aborts
    /// the remaining stages for this event only; the next run starts clean.
    /// When a leadership gate is supplied, the run aborts between stages as
    /// soon as leadership is gone.
    pub async fn run(
        &mut self,
        event: &mut ClusterEvent,
        gate: Option<&watch::Receiver<bool>>,
    ) -> StageResult<()> {
        debug!(pipeline = %self.name, event = %event.name(), "pipeline run starting");
        for stage in &mut self.stages {
            if let Some(gate) = gate {
                if !*gate.borrow() {
                    return Err(StageError::Aborted {
                        stage: stage.name(),
                    });
                }
            }
            stage.pre_process().await;
            if let Err(failure) = stage.process(event).await {
                error!(
                    pipeline = %self.name,
                    stage = stage.name(),
                    event = %event.name(),
                    %failure,
                    "stage failed, aborting remaining stages for this event"
                );
                return Err(failure);
            }
            stage.post_process().await;
        }
        info!(pipeline = %self.name, event = %event.name(), "pipeline run complete");
        Ok(())
    }

    pub async fn release(&mut self) {
        for stage in &mut self.stages {
            stage.release().await;
        }
    }
}

type SharedPipeline = Arc<tokio::sync::Mutex<Pipeline>>;

/// Maps event names to the pipelines they trigger. One pipeline may be
/// registered under several event names; it is initialized and released
/// once.
#[derive(Default)]
pub struct PipelineRegistry {
    by_event: HashMap<String, Vec<SharedPipeline>>,
    unique: Vec<SharedPipeline>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_name: impl Into<String>, pipeline: SharedPipeline) {
        if !self.unique.iter().any(|p| Arc::ptr_eq(p, &pipeline)) {
            self.unique.push(pipeline.clone());
        }
        self.by_event
            .entry(event_name.into())
            .or_default()
            .push(pipeline);
    }

    pub fn pipelines_for(&self, event_name: &str) -> Vec<SharedPipeline> {
        self.by_event.get(event_name).cloned().unwrap_or_default()
    }

    pub async fn init_all(&self, context: &StageContext) {
        for pipeline in &self.unique {
            pipeline.lock().await.init(context).await;
        }
    }

    pub async fn release_all(&self) {
        for pipeline in &self.unique {
            pipeline.lock().await.release().await;
        }
    }
}
