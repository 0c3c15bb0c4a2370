//! # Cluster Data Model
//!
//! Record types persisted in the metadata store: desired placement
//! (`IdealState`), observed replica state (`CurrentState`), participant
//! liveness (`LiveInstance`), per-instance configuration, the aggregated
//! `ExternalView`, and the transition `Message` exchanged between controller
//! and participants. All records serialize to JSON payloads; the store treats
//! them as opaque.

pub mod current_state;
pub mod external_view;
pub mod ideal_state;
pub mod instance_config;
pub mod live_instance;
pub mod message;
pub mod states;

pub use current_state::CurrentState;
pub use external_view::ExternalView;
pub use ideal_state::IdealState;
pub use instance_config::InstanceConfig;
pub use live_instance::LiveInstance;
pub use message::{Message, MessageState};
pub use states::{PartitionKey, State};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::metadata::{StoreError, StoreResult};

/// Encode a record for storage.
pub fn encode<T: Serialize>(record: &T) -> StoreResult<Value> {
    serde_json::to_value(record).map_err(|e| StoreError::BadRecord {
        path: String::new(),
        message: e.to_string(),
    })
}

/// Decode a record read from `path`.
pub fn decode<T: DeserializeOwned>(path: &str, value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::BadRecord {
        path: path.to_string(),
        message: e.to_string(),
    })
}
