//! Top-level configuration for a governed run.
//!
//! Every section has a sensible default, so an empty JSON object is a valid
//! configuration. Override only the fields you care about:
//!
//! ```json
//! {
//!   "queue": { "max_size": 200, "overflow": "reject" },
//!   "tripwire": { "max_steps": 25, "max_tokens": 200000 },
//!   "offload": { "token_threshold": 20000 }
//! }
//! ```
//!
//! The JSON schema for this file is printed by `runguard schema`.

use crate::delta::DeltaConfig;
use crate::error::{GovernError, GovernResult};
use crate::policy::{CompactionConfig, OffloadConfig, TripWireConfig};
use crate::queue::QueueConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Durable mutation queue.
    pub queue: QueueConfig,
    /// Budget ceilings. Every ceiling is unset by default.
    pub tripwire: TripWireConfig,
    /// Oversized tool result offload.
    pub offload: OffloadConfig,
    /// Context compaction.
    pub compaction: CompactionConfig,
    /// Streaming delta encoder.
    pub delta: DeltaConfig,
}

impl GovernanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> GovernResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded governance config");
        Ok(config)
    }

    /// Reject values that would make a component inert or ill-defined.
    pub fn validate(&self) -> GovernResult<()> {
        if self.queue.max_size == 0 {
            return Err(GovernError::Config("queue.max_size must be at least 1".into()));
        }
        if self.queue.max_retries == 0 {
            return Err(GovernError::Config(
                "queue.max_retries must be at least 1".into(),
            ));
        }
        if self.queue.flush_interval_ms == 0 {
            return Err(GovernError::Config(
                "queue.flush_interval_ms must be at least 1".into(),
            ));
        }
        let fraction = self.compaction.threshold_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(GovernError::Config(format!(
                "compaction.threshold_fraction must be in (0, 1], got {fraction}"
            )));
        }
        if self.compaction.max_tokens == 0 {
            return Err(GovernError::Config(
                "compaction.max_tokens must be at least 1".into(),
            ));
        }
        if self.delta.max_entries == 0 {
            return Err(GovernError::Config(
                "delta.max_entries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
