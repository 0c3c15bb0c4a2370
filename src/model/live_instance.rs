//! Participant liveness marker.

use serde::{Deserialize, Serialize};

use crate::metadata::SessionId;

/// Ephemeral record published by a connected participant. Its presence in
/// LIVE_INSTANCES *is* the liveness signal; the session identifies which
/// connection epoch owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveInstance {
    pub instance: String,
    pub session: SessionId,
}

impl LiveInstance {
    pub fn new(instance: impl Into<String>, session: SessionId) -> Self {
        Self {
            instance: instance.into(),
            session,
        }
    }
}
