//! Per-instance configuration seeded by the admin surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance: String,
    /// Disabled instances keep their live node but receive no assignments.
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl InstanceConfig {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            enabled: true,
            tags: Vec::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}
