use broker_provider::ParamSizeHint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request completion bound, chosen by model size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub small_secs: u64,
    pub medium_secs: u64,
    pub large_secs: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            small_secs: 30,
            medium_secs: 60,
            large_secs: 120,
        }
    }
}

impl TimeoutPolicy {
    pub fn bound_for(&self, hint: ParamSizeHint) -> Duration {
        let secs = match hint {
            ParamSizeHint::Small => self.small_secs,
            ParamSizeHint::Medium => self.medium_secs,
            ParamSizeHint::Large => self.large_secs,
        };
        Duration::from_secs(secs)
    }

    /// Bound after `escalations` provider timeouts. Each one moves up a size
    /// bucket; the result is never below the model's own bound.
    pub fn escalated(&self, hint: ParamSizeHint, escalations: u32) -> Duration {
        let mut bucket = hint;
        for _ in 0..escalations {
            bucket = bucket.escalate();
        }
        self.bound_for(bucket).max(self.bound_for(hint))
    }
}
