//! Tunables of the queue view.
//!
//! `bucket_count` and `slice_window_secs` are part of the on-disk layout:
//! changing them for an existing store makes already-written items
//! unreachable by re-derivation.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// What a browse does when one partition cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Yield the error and end the browse.
    #[default]
    FailFast,
    /// Report the failure on the side channel and keep going.
    SkipAndContinue,
}

/// When deletes trigger browse-start maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "every")]
pub enum AdvancePolicy {
    /// After every delete.
    Eager,
    /// After every n-th delete handled by this process.
    EveryNth(u32),
    /// Only when `advance_browse_start` is called explicitly.
    Manual,
}

impl Default for AdvancePolicy {
    fn default() -> Self {
        AdvancePolicy::EveryNth(100)
    }
}

/// Retry settings for transient storage errors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Write fan-out per slice. Fixed at schema creation.
    pub bucket_count: u32,
    /// Width of one slice in seconds. Fixed at schema creation.
    pub slice_window_secs: u64,
    /// Records fetched per storage round trip.
    pub page_size: usize,
    /// Partitions whose first page is fetched concurrently during a browse.
    pub fan_out: usize,
    pub failure_policy: FailurePolicy,
    pub advance_policy: AdvancePolicy,
    /// Slices behind "now" that maintenance never advances past, and that
    /// a new queue's browse start is opened behind its first item.
    pub settle_slices: u32,
    pub retry: RetryConfig,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            bucket_count: 1,
            slice_window_secs: 3_600,
            page_size: 100,
            fan_out: 4,
            failure_policy: FailurePolicy::default(),
            advance_policy: AdvancePolicy::default(),
            settle_slices: 1,
            retry: RetryConfig::default(),
        }
    }
}

impl ViewConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ViewConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the view cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::Config("bucket_count must be at least 1".into()));
        }
        if self.slice_window_secs == 0 {
            return Err(Error::Config("slice_window_secs must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be at least 1".into()));
        }
        if self.fan_out == 0 {
            return Err(Error::Config("fan_out must be at least 1".into()));
        }
        if self.settle_slices == 0 {
            return Err(Error::Config("settle_slices must be at least 1".into()));
        }
        if self.advance_policy == AdvancePolicy::EveryNth(0) {
            return Err(Error::Config("advance_policy every must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn slice_window(&self) -> Duration {
        Duration::from_secs(self.slice_window_secs)
    }
}
