//! Admission limits.

use serde::{Deserialize, Serialize};

use super::controller::SlotKind;

/// Capacity and memory limits for the two worker pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum concurrent preparation workers.
    #[serde(default = "default_max_preparation")]
    pub max_preparation: usize,

    /// Maximum concurrent watch workers.
    #[serde(default = "default_max_watch")]
    pub max_watch: usize,

    /// No slot of either kind is granted at or above this utilization.
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f32,

    /// Separate ceiling for watch slots. When unset, watch admission shares
    /// `max_memory_percent`.
    #[serde(default)]
    pub watch_memory_percent: Option<f32>,
}

fn default_max_preparation() -> usize {
    4
}

fn default_max_watch() -> usize {
    12
}

fn default_max_memory_percent() -> f32 {
    80.0
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_preparation: default_max_preparation(),
            max_watch: default_max_watch(),
            max_memory_percent: default_max_memory_percent(),
            watch_memory_percent: None,
        }
    }
}

impl AdmissionConfig {
    /// Capacity limit for a slot kind.
    pub fn limit(&self, kind: SlotKind) -> usize {
        match kind {
            SlotKind::Preparation => self.max_preparation,
            SlotKind::Watch => self.max_watch,
        }
    }

    /// Memory ceiling for a slot kind.
    pub fn memory_ceiling(&self, kind: SlotKind) -> f32 {
        match kind {
            SlotKind::Preparation => self.max_memory_percent,
            SlotKind::Watch => self.watch_memory_percent.unwrap_or(self.max_memory_percent),
        }
    }
}
