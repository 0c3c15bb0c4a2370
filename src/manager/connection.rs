//! Manager connection lifecycle.
//!
//! A manager moves through
//! `Disconnected -> Connecting -> Connected -> (SessionExpired -> Connecting)`
//! and ends in `Terminated` once explicitly disconnected; terminated managers
//! are never reused. Only one outbound transition is legal from any state;
//! `connect`/`disconnect` calls are serialized by the manager's lifecycle
//! lock.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role a manager plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    /// Hosts partition replicas and executes state transitions.
    Participant,
    /// Runs the stage pipeline when elected leader.
    Controller,
    /// Observes cluster state without participating.
    Spectator,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Participant => write!(f, "participant"),
            Self::Controller => write!(f, "controller"),
            Self::Spectator => write!(f, "spectator"),
        }
    }
}

/// Connection lifecycle states. `Terminated` is the terminal
/// "disconnected" state reached through an explicit `disconnect()` or an
/// unrecoverable reconnect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    SessionExpired,
    Terminated,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (*self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Terminated)
                | (Connected, SessionExpired)
                | (Connected, Terminated)
                | (SessionExpired, Connecting)
                | (SessionExpired, Terminated)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::SessionExpired => write!(f, "session_expired"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}
