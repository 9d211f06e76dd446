//! Scheduler configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! loop_policy = "alternate"
//! lease_timeout_ms = 30000
//! initial_resources = ["online"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the loop picks between planning and execution work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPolicy {
    /// Plan whenever anything is waiting to be planned, otherwise execute.
    #[default]
    PlanFirst,
    /// Take turns between planning and execution when both have work.
    Alternate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub loop_policy: LoopPolicy,
    /// The liveness lease expires after this long without a renewal.
    pub lease_timeout_ms: u64,
    /// Buffer size of the lifecycle event feed.
    pub event_capacity: usize,
    /// Resources considered available when the scheduler starts.
    pub initial_resources: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            loop_policy: LoopPolicy::PlanFirst,
            lease_timeout_ms: 45_000,
            event_capacity: 256,
            initial_resources: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl SchedulerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn with_initial_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_loop_policy(mut self, policy: LoopPolicy) -> Self {
        self.loop_policy = policy;
        self
    }
}
