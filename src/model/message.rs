//! Transition request messages.
//!
//! Created by the controller, written under the target instance's MESSAGES
//! path, claimed by exactly one participant via a version-checked write,
//! executed, and deleted. The claim CAS is what makes duplicate delivery
//! detectable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::states::State;
use crate::constants::CONTROLLER_SOURCE;
use crate::metadata::SessionId;

/// Lifecycle of a message record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Written by the controller, not yet claimed.
    New,
    /// Claimed by the recipient; execution in progress.
    Read,
    /// Executed successfully; deletion follows.
    Completed,
    /// Execution failed; an error record was written.
    Error,
}

/// A state-transition request for one partition replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub msg_state: MessageState,
    /// Originating process, `controller` for pipeline-generated messages.
    pub source: String,
    /// Recipient instance name.
    pub target: String,
    /// Session the recipient held when the message was generated. A message
    /// addressed to a session the instance no longer holds is stale.
    pub target_session: SessionId,
    pub resource: String,
    pub partition: String,
    pub from_state: State,
    pub to_state: State,
    /// Name of the state model definition governing the transition.
    pub state_model_def: String,
    pub created_at: DateTime<Utc>,
    /// After this many milliseconds an undelivered message is considered
    /// failed; resend/escalate policy is the sender's call.
    pub timeout_ms: Option<u64>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn transition(
        target: impl Into<String>,
        target_session: SessionId,
        resource: impl Into<String>,
        partition: impl Into<String>,
        from_state: State,
        to_state: State,
        state_model_def: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_state: MessageState::New,
            source: CONTROLLER_SOURCE.to_string(),
            target: target.into(),
            target_session,
            resource: resource.into(),
            partition: partition.into(),
            from_state,
            to_state,
            state_model_def: state_model_def.into(),
            created_at: Utc::now(),
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Still awaiting execution (unclaimed or claimed-but-unfinished).
    pub fn is_pending(&self) -> bool {
        matches!(self.msg_state, MessageState::New | MessageState::Read)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.timeout_ms {
            Some(ms) => {
                let age = now.signed_duration_since(self.created_at);
                age.num_milliseconds() >= 0 && age.num_milliseconds() as u64 >= ms
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message() -> Message {
        Message::transition(
            "node-1",
            SessionId::new(7),
            "db",
            "db_0",
            State::offline(),
            State::online(),
            "OnlineOffline",
        )
    }

    #[test]
    fn test_new_message_is_pending() {
        let msg = message();
        assert_eq!(msg.msg_state, MessageState::New);
        assert!(msg.is_pending());
        assert_eq!(msg.source, "controller");
    }

    #[test]
    fn test_expiry() {
        let msg = message().with_timeout_ms(1_000);
        assert!(!msg.is_expired(msg.created_at));
        assert!(!msg.is_expired(msg.created_at + Duration::milliseconds(999)));
        assert!(msg.is_expired(msg.created_at + Duration::milliseconds(1_000)));

        let no_timeout = message();
        assert!(!no_timeout.is_expired(no_timeout.created_at + Duration::days(365)));
    }

    #[test]
    fn test_roundtrip() {
        let msg = message();
        let value = serde_json::to_value(&msg).unwrap();
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.from_state, State::offline());
        assert_eq!(back.to_state, State::online());
    }
}
