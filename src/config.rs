//! Configuration types for inflight.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheduling policy for admitting and pausing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPolicy {
    /// Admit optimistically whenever the immediate next step fits in the
    /// free list. May pause an admitted request later under memory pressure.
    MaxUtilization,
    /// Admit only when worst-case block need (declared maximum length at the
    /// declared beam width) can be reserved. Admitted requests are never
    /// paused.
    GuaranteedNoEvict,
}

impl SchedulerPolicy {
    /// Get the policy name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxUtilization => "MaxUtilization",
            Self::GuaranteedNoEvict => "GuaranteedNoEvict",
        }
    }
}

/// Batch manager configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManagerConfig {
    /// Maximum number of requests executing concurrently.
    pub max_num_requests: usize,
    /// Maximum beam width any request may declare.
    pub max_beam_width: usize,
    /// Tokens per KV cache block. Must be a power of two.
    pub block_size: usize,
    /// Total number of blocks in the pool, fixed from the memory budget.
    pub num_blocks: usize,
    /// Scheduling policy.
    pub policy: SchedulerPolicy,
}

impl Default for BatchManagerConfig {
    fn default() -> Self {
        Self {
            max_num_requests: 256,
            max_beam_width: 4,
            block_size: 16,
            num_blocks: 1024,
            policy: SchedulerPolicy::GuaranteedNoEvict,
        }
    }
}

impl BatchManagerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any bound is zero or the block size is
    /// not a power of two.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_requests == 0 {
            return Err(Error::Config("max_num_requests must be > 0".to_string()));
        }
        if self.max_beam_width == 0 {
            return Err(Error::Config("max_beam_width must be > 0".to_string()));
        }
        if self.num_blocks == 0 {
            return Err(Error::Config("num_blocks must be > 0".to_string()));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BatchManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_block_size_must_be_power_of_two() {
        let mut config = BatchManagerConfig::default();
        config.block_size = 12;
        assert!(config.validate().is_err());

        config.block_size = 32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let mut config = BatchManagerConfig::default();
        config.max_num_requests = 0;
        assert!(config.validate().is_err());

        let mut config = BatchManagerConfig::default();
        config.num_blocks = 0;
        assert!(config.validate().is_err());
    }
}
