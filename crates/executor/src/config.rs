//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors
///
/// Raised by [`PoolConfig::validate`] before any worker is started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Core pool size must be at least one
    #[error("core_pool_size must be greater than zero")]
    ZeroCorePoolSize,

    /// Max pool size below core pool size
    #[error("max_pool_size ({max}) must be >= core_pool_size ({core})")]
    MaxBelowCore { core: usize, max: usize },

    /// Spare target above max pool size
    #[error("min_spare_workers ({spare}) must be <= max_pool_size ({max})")]
    SpareAboveMax { spare: usize, max: usize },

    /// Per-worker queues must hold at least one task
    #[error("queue_capacity must be greater than zero")]
    ZeroQueueCapacity,

    /// Keep-alive must be a positive duration
    #[error("keep_alive must be greater than zero")]
    ZeroKeepAlive,

    /// Event channel must have room for at least one event
    #[error("event_capacity must be greater than zero")]
    ZeroEventCapacity,
}

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use spindle_executor::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new("ingest")
///     .with_core_pool_size(2)
///     .with_max_pool_size(8)
///     .with_queue_capacity(32)
///     .with_keep_alive(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Pool name, used as the worker name prefix
    pub name: String,

    /// Workers created eagerly that never retire from idleness
    pub core_pool_size: usize,

    /// Upper bound on live workers
    pub max_pool_size: usize,

    /// Capacity of each worker's private queue
    pub queue_capacity: usize,

    /// How long a non-core worker may sit idle before retiring
    #[serde(with = "duration_millis")]
    pub keep_alive: Duration,

    /// Idle workers to restore when a worker exits (best effort)
    pub min_spare_workers: usize,

    /// Buffered events per subscriber before lagging
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            core_pool_size: 2,
            max_pool_size: 4,
            queue_capacity: 5,
            keep_alive: Duration::from_secs(5),
            min_spare_workers: 1,
            event_capacity: 256,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given pool name and default sizing
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = std::env::var("POOL_NAME").unwrap_or(defaults.name);
        let keep_alive = env_parse::<u64>("POOL_KEEP_ALIVE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.keep_alive);

        Self {
            name,
            core_pool_size: env_parse("POOL_CORE_SIZE").unwrap_or(defaults.core_pool_size),
            max_pool_size: env_parse("POOL_MAX_SIZE").unwrap_or(defaults.max_pool_size),
            queue_capacity: env_parse("POOL_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            keep_alive,
            min_spare_workers: env_parse("POOL_MIN_SPARE").unwrap_or(defaults.min_spare_workers),
            event_capacity: defaults.event_capacity,
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the core pool size
    pub fn with_core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    /// Set the maximum pool size
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the per-worker queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the keep-alive duration for non-core workers
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the spare worker target
    pub fn with_min_spare_workers(mut self, spare: usize) -> Self {
        self.min_spare_workers = spare;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_pool_size == 0 {
            return Err(ConfigError::ZeroCorePoolSize);
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(ConfigError::MaxBelowCore {
                core: self.core_pool_size,
                max: self.max_pool_size,
            });
        }
        if self.min_spare_workers > self.max_pool_size {
            return Err(ConfigError::SpareAboveMax {
                spare: self.min_spare_workers,
                max: self.max_pool_size,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.keep_alive.is_zero() {
            return Err(ConfigError::ZeroKeepAlive);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }

    /// Total queue slots when the pool is at its maximum size
    pub fn max_queued_tasks(&self) -> usize {
        self.max_pool_size.saturating_mul(self.queue_capacity)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
