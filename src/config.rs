// Ingest configuration
// Explicit settings threaded into the stream processor and batch persister.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IngestError;

/// Default number of records persisted per batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default sample ceiling used in limited mode
pub const DEFAULT_SAMPLE_SIZE: usize = 100_000;

/// Accepted records between progress events
pub const DEFAULT_PROGRESS_INTERVAL: usize = 10_000;

/// Sampling (limited mode) settings, supplied once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Stop ingesting once `sample_size` records have been accepted
    pub limited: bool,
    pub sample_size: usize,
}

impl SamplingConfig {
    /// Full-dataset run: no cutoff
    pub fn unlimited() -> Self {
        SamplingConfig {
            limited: false,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    pub fn limited(sample_size: usize) -> Self {
        SamplingConfig {
            limited: true,
            sample_size,
        }
    }

    /// True once `accepted` records (cumulative across the run) hit the ceiling
    pub fn is_reached(&self, accepted: usize) -> bool {
        self.limited && accepted >= self.sample_size
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig::limited(DEFAULT_SAMPLE_SIZE)
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,

    /// Upper bound for a single backend call (lock wait)
    #[serde(default = "default_call_timeout")]
    pub call_timeout: Duration,

    /// Stop the run at the first failed batch
    #[serde(default = "default_halt")]
    pub halt_on_batch_failure: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_progress_interval() -> usize {
    DEFAULT_PROGRESS_INTERVAL
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_halt() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            sampling: SamplingConfig::default(),
            batch_size: default_batch_size(),
            progress_interval: default_progress_interval(),
            call_timeout: default_call_timeout(),
            halt_on_batch_failure: default_halt(),
        }
    }
}

impl IngestConfig {
    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_halt_on_batch_failure(mut self, halt: bool) -> Self {
        self.halt_on_batch_failure = halt;
        self
    }

    /// Reject settings that would stall or never persist anything
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.progress_interval == 0 {
            return Err(IngestError::InvalidConfig(
                "progress_interval must be greater than zero".to_string(),
            ));
        }
        if self.sampling.limited && self.sampling.sample_size == 0 {
            return Err(IngestError::InvalidConfig(
                "sample_size must be greater than zero in limited mode".to_string(),
            ));
        }
        Ok(())
    }
}
