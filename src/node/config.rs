use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a PermTreeNode instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// How long a submitting caller waits for its own activity's apply
    /// phase, in milliseconds. A timeout surfaces as an error without
    /// retracting the activity's effect elsewhere.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
}

fn default_completion_timeout_ms() -> u64 {
    30_000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: default_completion_timeout_ms(),
        }
    }
}

impl SecurityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the completion wait bound.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}
