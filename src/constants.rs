//! # System Constants
//!
//! Store layout segments, cluster event names, and the built-in state names
//! shared across the coordination core.

/// Store-path segments for the persisted cluster layout.
pub mod paths {
    pub const CONFIGS: &str = "CONFIGS";
    pub const LIVE_INSTANCES: &str = "LIVE_INSTANCES";
    pub const IDEAL_STATES: &str = "IDEAL_STATES";
    pub const EXTERNAL_VIEW: &str = "EXTERNAL_VIEW";
    pub const INSTANCES: &str = "INSTANCES";
    pub const CURRENT_STATE: &str = "CURRENT_STATE";
    pub const MESSAGES: &str = "MESSAGES";
    pub const ERRORS: &str = "ERRORS";
    pub const CONTROLLER: &str = "CONTROLLER";
    pub const LEADER: &str = "LEADER";
}

/// Cluster events that trigger controller pipeline runs.
pub mod events {
    pub const IDEAL_STATE_CHANGE: &str = "ideal_state_change";
    pub const CONFIG_CHANGE: &str = "config_change";
    pub const LIVE_INSTANCE_CHANGE: &str = "live_instance_change";
    pub const CURRENT_STATE_CHANGE: &str = "current_state_change";
    pub const MESSAGE_CHANGE: &str = "message_change";
    pub const PERIODIC_REBALANCE: &str = "periodic_rebalance";
}

/// Built-in state names used by the OnlineOffline state model and by the
/// engine's error handling.
pub mod states {
    pub const OFFLINE: &str = "OFFLINE";
    pub const ONLINE: &str = "ONLINE";
    pub const DROPPED: &str = "DROPPED";
    pub const ERROR: &str = "ERROR";
}

/// Name of the built-in OnlineOffline state model definition.
pub const ONLINE_OFFLINE: &str = "OnlineOffline";

/// Source name stamped on controller-generated messages.
pub const CONTROLLER_SOURCE: &str = "controller";
