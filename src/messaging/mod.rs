//! # Messaging Service
//!
//! Store-backed message delivery: `send` durably records a message under
//! the recipient's MESSAGES path, the recipient observes it via its watch,
//! claims it, and writes the result back. Delivery is pull, not push; the
//! sender owns the give-up/resend policy for messages that expire
//! unanswered.

pub mod service;

pub use service::{Criteria, InstanceSelector, MessagingService};

use thiserror::Error;

use crate::metadata::StoreError;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("message target {instance} is not a live instance")]
    TargetNotLive { instance: String },

    #[error("broadcast criteria matched no live instances")]
    NoRecipients,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type MessagingResult<T> = std::result::Result<T, MessagingError>;
