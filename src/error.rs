//! # Crate-Level Error Handling
//!
//! Umbrella error type aggregating the per-module error enums. Each
//! subsystem defines its own `thiserror` enum; this module folds them into a
//! single `FlockError` for callers that span subsystems.

use thiserror::Error;

use crate::controller::stage::StageError;
use crate::manager::ManagerError;
use crate::messaging::MessagingError;
use crate::metadata::StoreError;
use crate::participant::TransitionError;

/// Top-level error for the coordination core.
#[derive(Error, Debug)]
pub enum FlockError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, FlockError>;
