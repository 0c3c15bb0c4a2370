//! # Participant State-Machine Engine
//!
//! Per-process registry of state-model factories plus the engine that
//! executes constrained state transitions on command. Transitions for one
//! (resource, partition) key are serialized; distinct keys run concurrently.
//! The `MessageConsumer` bridges the manager's message notifications to the
//! engine, claiming each message exactly once before execution.

pub mod consumer;
pub mod engine;
pub mod factory;
pub mod state_model;

pub use consumer::MessageConsumer;
pub use engine::{PartitionReplica, StateMachineEngine};
pub use factory::{OnlineOfflineStateModelFactory, StateModelFactory};
pub use state_model::{
    FnHandler, StateModel, StateModelBuilder, StateModelDef, TransitionHandler,
};

use thiserror::Error;

use crate::metadata::StoreError;
use crate::model::{PartitionKey, State};

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition for {key}: recorded state is {actual}, message expects {expected}")]
    InvalidTransition {
        key: PartitionKey,
        expected: State,
        actual: State,
    },

    #[error("state model {state_model} defines no transition {from} -> {to}")]
    NoSuchTransition {
        state_model: String,
        from: State,
        to: State,
    },

    #[error("no state model factory registered for {state_model}")]
    NoSuchFactory { state_model: String },

    #[error("transition handler failed for {key}: {reason}")]
    HandlerFailed { key: PartitionKey, reason: String },

    #[error("notification context carries no session")]
    MissingSession,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure raised by application handler code.
    #[error("{0}")]
    Application(String),
}

pub type TransitionResult<T> = std::result::Result<T, TransitionError>;
