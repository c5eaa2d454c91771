use serde::Deserialize;

use crate::error::{invalid_argument, ReplicaResult};

pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Configuration of a [`crate::ReplicaEngine`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicaSettings {
    /// Whether `start()` connects the watch and write streams.
    pub network_enabled: bool,
    pub stream_backoff: BackoffSettings,
    pub storage_retry: StorageRetrySettings,
    /// Batches fetched into the write pipeline ahead of the one in flight.
    pub max_pending_writes: usize,
    pub max_concurrent_limbo_resolutions: usize,
    pub field_indexes: Vec<FieldIndexSettings>,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            network_enabled: true,
            stream_backoff: BackoffSettings::default(),
            storage_retry: StorageRetrySettings::default(),
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            field_indexes: Vec::new(),
        }
    }
}

impl ReplicaSettings {
    pub fn from_json_str(json: &str) -> ReplicaResult<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|err| invalid_argument(format!("Invalid replica settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ReplicaResult<()> {
        if self.max_pending_writes == 0 {
            return Err(invalid_argument("max_pending_writes must be at least 1"));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be at least 1",
            ));
        }
        if self.stream_backoff.multiplier < 1.0 {
            return Err(invalid_argument("stream_backoff.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.stream_backoff.jitter) {
            return Err(invalid_argument("stream_backoff.jitter must be within [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the base delay added or subtracted at random.
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_ms: 60_000,
            jitter: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageRetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for StorageRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 100,
        }
    }
}

/// A client-side equality index over one field of one collection.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FieldIndexSettings {
    pub collection: String,
    pub field: String,
}
