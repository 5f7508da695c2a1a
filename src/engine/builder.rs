//! Copy configuration and its builder.

use std::time::Duration;

use crate::error::{CopyError, Result};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_BATCH_CAPACITY: u32 = 64;
pub const DEFAULT_MIN_DRAIN_THRESHOLD: usize = 16;

/// What to do when the facility or the destination makes only partial
/// progress on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressPolicy {
    /// Fail the copy on the first partial result.
    #[default]
    Abort,
    /// Continue with the remainder (unaccepted requests, unwritten bytes).
    Resume,
}

/// Parameters of one copy.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Bytes per I/O unit (one slot).
    pub block_size: usize,
    /// Maximum number of simultaneously outstanding requests.
    pub batch_capacity: u32,
    /// Low-water mark passed as the minimum to every completion wait.
    pub min_drain_threshold: usize,
    /// `None` waits forever.
    pub wait_timeout: Option<Duration>,
    pub submit_policy: ProgressPolicy,
    pub write_policy: ProgressPolicy,
}

impl Default for CopyConfig {
    fn default() -> Self {
        CopyConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            min_drain_threshold: DEFAULT_MIN_DRAIN_THRESHOLD,
            wait_timeout: None,
            submit_policy: ProgressPolicy::Abort,
            write_policy: ProgressPolicy::Abort,
        }
    }
}

impl CopyConfig {
    pub fn builder() -> CopyConfigBuilder {
        CopyConfigBuilder::new()
    }

    /// Bytes moved by one full batch, `batch_capacity * block_size`.
    pub fn round_bytes(&self) -> u64 {
        self.batch_capacity as u64 * self.block_size as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CopyError::Config("block size must be at least 1 byte".into()));
        }
        if self.block_size > u32::MAX as usize {
            return Err(CopyError::Config(format!(
                "block size {} exceeds the per-request limit of {} bytes",
                self.block_size,
                u32::MAX
            )));
        }
        if self.batch_capacity == 0 {
            return Err(CopyError::Config("batch capacity must be at least 1".into()));
        }
        if self.min_drain_threshold == 0
            || self.min_drain_threshold > self.batch_capacity as usize
        {
            return Err(CopyError::Config(format!(
                "minimum drain threshold {} must be between 1 and the batch capacity {}",
                self.min_drain_threshold, self.batch_capacity
            )));
        }
        Ok(())
    }
}

pub struct CopyConfigBuilder {
    config: CopyConfig,
}

impl Default for CopyConfigBuilder {
    fn default() -> Self {
        CopyConfigBuilder {
            config: CopyConfig::default(),
        }
    }
}

impl CopyConfigBuilder {
    pub fn new() -> Self {
        CopyConfigBuilder::default()
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    pub fn batch_capacity(mut self, capacity: u32) -> Self {
        self.config.batch_capacity = capacity;
        self
    }

    pub fn min_drain_threshold(mut self, threshold: usize) -> Self {
        self.config.min_drain_threshold = threshold;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    pub fn submit_policy(mut self, policy: ProgressPolicy) -> Self {
        self.config.submit_policy = policy;
        self
    }

    pub fn write_policy(mut self, policy: ProgressPolicy) -> Self {
        self.config.write_policy = policy;
        self
    }

    pub fn build(self) -> Result<CopyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_copy() {
        let config = CopyConfig::builder().build().unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.batch_capacity, 64);
        assert_eq!(config.round_bytes(), 262_144);
        assert_eq!(config.wait_timeout, None);
        assert_eq!(config.submit_policy, ProgressPolicy::Abort);
    }

    #[test]
    fn threshold_must_fit_the_batch() {
        let err = CopyConfig::builder()
            .batch_capacity(4)
            .min_drain_threshold(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));

        let err = CopyConfig::builder()
            .min_drain_threshold(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(CopyConfig::builder().block_size(0).build().is_err());
        assert!(CopyConfig::builder()
            .batch_capacity(0)
            .min_drain_threshold(1)
            .build()
            .is_err());
    }
}
