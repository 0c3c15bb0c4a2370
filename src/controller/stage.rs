//! The pipeline stage contract.
//!
//! Stages are long-lived: one `init`/`release` per controller lifetime, with
//! `pre_process -> process -> post_process` running per event, strictly in
//! stage order. All per-event state flows through the event's attribute map;
//! a stage failure aborts the remaining stages of that run only.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::event::ClusterEvent;
use super::StateModelDefRegistry;
use crate::config::FlockConfig;
use crate::messaging::MessagingError;
use crate::metadata::{ClusterPaths, MetadataStore, StoreError};

/// Long-lived dependencies handed to every stage at `init`.
#[derive(Clone)]
pub struct StageContext {
    pub cluster: String,
    /// Name of the controller process running the pipeline.
    pub instance: String,
    pub store: Arc<dyn MetadataStore>,
    pub paths: ClusterPaths,
    pub config: FlockConfig,
    pub state_model_defs: StateModelDefRegistry,
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("stage {stage} requires attribute {attribute}, which no earlier stage produced")]
    MissingAttribute {
        stage: &'static str,
        attribute: &'static str,
    },

    #[error("stage {stage} invoked before init")]
    NotInitialized { stage: &'static str },

    #[error("pipeline run aborted before stage {stage}: leadership lost")]
    Aborted { stage: &'static str },

    #[error("stage {stage} failed: {reason}")]
    Failed { stage: &'static str, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

pub type StageResult<T> = std::result::Result<T, StageError>;

/// A logically independent unit in processing cluster-change events.
///
/// `process` must be idempotent with respect to re-delivery of the same
/// event content: every run re-reads store state, so recomputing is always
/// safe.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once when the pipeline is wired to a controller.
    async fn init(&mut self, context: StageContext);

    /// Called before `process` on each event.
    async fn pre_process(&mut self) {}

    /// The per-event processing logic.
    async fn process(&mut self, event: &mut ClusterEvent) -> StageResult<()>;

    /// Called after `process` on each event.
    async fn post_process(&mut self) {}

    /// Called once when the controller shuts down.
    async fn release(&mut self) {}
}
