//! Cluster events and their typed attribute map.
//!
//! A `ClusterEvent` is owned by exactly one pipeline run: stages communicate
//! by writing attributes that later stages read, and the event is discarded
//! when the run ends. The map is heterogeneous with typed accessors, so
//! stage outputs keep their concrete types without a serialization hop.

use std::any::Any;
use std::collections::HashMap;

/// Well-known attribute keys written by the standard stages.
pub mod attributes {
    /// `SessionId` of the controller connection running the pipeline.
    pub const SESSION: &str = "session";
    /// `ClusterDataCache` produced by the read-cluster-data stage.
    pub const CLUSTER_DATA: &str = "cluster_data_cache";
    /// `CurrentStateOutput` produced by the current-state stage.
    pub const CURRENT_STATES: &str = "current_state_output";
    /// `BestPossibleStateOutput` produced by the best-possible-state stage.
    pub const BEST_POSSIBLE: &str = "best_possible_state";
    /// `Vec<Message>` produced by the message-generation stage.
    pub const GENERATED_MESSAGES: &str = "generated_messages";
    /// `Vec<StaleMessage>` produced by the message-generation stage.
    pub const STALE_MESSAGES: &str = "stale_messages";
}

/// A named occurrence carrying the mutable pipeline context.
pub struct ClusterEvent {
    name: String,
    attributes: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl ClusterEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_attribute<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Box::new(value));
    }

    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn take_attribute<T: Any + Send + Sync>(&mut self, key: &str) -> Option<T> {
        let boxed = self.attributes.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                // Wrong type requested; put it back untouched.
                self.attributes.insert(key.to_string(), other);
                None
            }
        }
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_attributes() {
        let mut event = ClusterEvent::new("live_instance_change");
        event.set_attribute("count", 3usize);
        event.set_attribute("label", "rebalance".to_string());

        assert_eq!(event.attribute::<usize>("count"), Some(&3));
        assert_eq!(event.attribute::<String>("label").map(String::as_str), Some("rebalance"));
        // Wrong type reads as absent, not as a panic.
        assert_eq!(event.attribute::<u32>("count"), None);
        assert!(event.attribute::<usize>("missing").is_none());
    }

    #[test]
    fn test_take_attribute_with_wrong_type_preserves_value() {
        let mut event = ClusterEvent::new("test");
        event.set_attribute("n", 7i64);
        assert!(event.take_attribute::<String>("n").is_none());
        assert_eq!(event.take_attribute::<i64>("n"), Some(7));
        assert!(!event.has_attribute("n"));
    }
}
