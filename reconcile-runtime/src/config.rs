//! Tunables of a [`Controller`](crate::Controller)
use crate::workqueue::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};
use reconcile_core::Duration;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    hash::Hash,
    path::{Path, PathBuf},
    time,
};
use thiserror::Error;

/// Errors from loading a [`Config`]
#[derive(Debug, Error)]
pub enum Error {
    /// The config file could not be read
    #[error("failed to read config from {1:?}: {0}")]
    Read(#[source] std::io::Error, PathBuf),

    /// The config is not valid YAML or has unexpected fields
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// The values do not make sense together
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Controller settings
///
/// All fields are optional when deserializing, missing ones keep their defaults.
/// Durations are written the Go way:
///
/// ```yaml
/// workers: 2
/// maxRetries: 5
/// baseDelay: 5ms
/// maxDelay: 16m40s
/// qps: 10
/// burst: 100
/// cacheSyncTimeout: 1m
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Number of keys reconciled concurrently
    pub workers: usize,
    /// How often a failing key is requeued before it is dropped
    pub max_retries: u32,
    /// Backoff after the first failure of a key, doubled on each further failure
    pub base_delay: Duration,
    /// Upper bound of the per-key backoff
    pub max_delay: Duration,
    /// Overall retry rate across all keys, non-positive disables the limit
    pub qps: f64,
    /// How many retries may exceed `qps` in a burst
    pub burst: u32,
    /// How long to wait for the first full listing before giving up
    pub cache_sync_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 5,
            base_delay: time::Duration::from_millis(5).into(),
            max_delay: time::Duration::from_secs(1000).into(),
            qps: 10.0,
            burst: 100,
            cache_sync_timeout: time::Duration::from_secs(60).into(),
        }
    }
}

impl Config {
    /// Parse a config from YAML text
    ///
    /// # Errors
    ///
    /// Fails on malformed YAML, unknown fields, or values that do not make sense together.
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(text).map_err(Error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config from a YAML file
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, or like [`from_yaml`](Self::from_yaml).
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = fs::read_to_string(&path).map_err(|source| Error::Read(source, path.as_ref().into()))?;
        Self::from_yaml(&data)
    }

    /// Check that the values make sense together
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::Invalid("workers must be at least 1".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::Invalid(format!(
                "maxDelay ({}) must not be shorter than baseDelay ({})",
                self.max_delay, self.base_delay
            )));
        }
        if self.qps.is_nan() {
            return Err(Error::Invalid("qps must be a number".into()));
        }
        Ok(())
    }

    /// Sets the number of workers
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets how often a failing key is retried
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the per-key backoff range
    #[must_use]
    pub fn backoff(mut self, base_delay: time::Duration, max_delay: time::Duration) -> Self {
        self.base_delay = base_delay.into();
        self.max_delay = max_delay.into();
        self
    }

    /// Sets the overall retry rate
    #[must_use]
    pub fn rate(mut self, qps: f64, burst: u32) -> Self {
        self.qps = qps;
        self.burst = burst;
        self
    }

    /// Sets how long to wait for the cache to sync
    #[must_use]
    pub fn cache_sync_timeout(mut self, timeout: time::Duration) -> Self {
        self.cache_sync_timeout = timeout.into();
        self
    }

    /// The rate limiter a controller with this config requeues failed keys through
    ///
    /// Per-key exponential backoff combined with an overall token bucket, the worst of both wins.
    #[must_use]
    pub fn rate_limiter<T>(&self) -> MaxOfRateLimiter<T>
    where
        T: Clone + Eq + Hash + Send + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::exponential(
                self.base_delay.into(),
                self.max_delay.into(),
            )) as Box<dyn RateLimiter<T>>,
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}
