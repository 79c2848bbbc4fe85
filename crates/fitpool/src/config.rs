//! Pool configuration
//!
//! [`PoolConfig`] carries every knob of the scheduler and both transports.
//! It can be built in code with the `with_*` methods or read from the
//! environment with [`PoolConfig::from_env`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport backend used to reach the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Local worker threads fed through shared queues
    ProcessPool,
    /// Remote engines reached through futures
    Distributed,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessPool => write!(f, "process_pool"),
            Self::Distributed => write!(f, "distributed"),
        }
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "process_pool" | "multiprocessing" => Ok(Self::ProcessPool),
            "distributed" | "cluster" | "ipyparallel" => Ok(Self::Distributed),
            other => Err(ConfigError::InvalidValue {
                key: "FITPOOL_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    /// Settings are inconsistent
    #[error("invalid pool configuration: {0}")]
    Invalid(String),
}

/// Scheduler and transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Transport backend
    pub backend: Backend,

    /// Number of workers (pool capacity)
    pub num_workers: usize,

    /// Result timeout, also the stall limit of the dispatch loop
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Idle interval of the dispatch loop and of the workers' polling
    #[serde(with = "duration_millis")]
    pub timestep: Duration,

    /// How long a ping round waits before collecting pongs
    #[serde(with = "duration_millis")]
    pub ping_grace: Duration,

    /// Capacity of the load-balanced queue of the local cluster
    pub queue_capacity: usize,

    /// How long shutdown waits for worker threads to exit
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: Backend::ProcessPool,
            num_workers: default_num_workers(),
            timeout: Duration::from_secs(15),
            timestep: Duration::from_millis(1),
            ping_grace: Duration::from_millis(500),
            queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// One worker per core, leaving one for the coordinating task
fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl PoolConfig {
    /// Create a configuration for the given backend
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FITPOOL_BACKEND`: `process` or `distributed` (default: `process`)
    /// - `FITPOOL_WORKERS`: number of workers (default: cores - 1)
    /// - `FITPOOL_TIMEOUT_MS`: result timeout (default: 15000)
    /// - `FITPOOL_TIMESTEP_MS`: idle interval (default: 1)
    /// - `FITPOOL_PING_GRACE_MS`: ping grace period (default: 500)
    /// - `FITPOOL_QUEUE_CAPACITY`: load-balanced queue capacity (default: 1024)
    /// - `FITPOOL_SHUTDOWN_TIMEOUT_MS`: worker join timeout (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("FITPOOL_BACKEND") {
            config.backend = value.parse()?;
        }
        if let Some(n) = parse_var(&lookup, "FITPOOL_WORKERS")? {
            config.num_workers = n as usize;
        }
        if let Some(ms) = parse_var(&lookup, "FITPOOL_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "FITPOOL_TIMESTEP_MS")? {
            config.timestep = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "FITPOOL_PING_GRACE_MS")? {
            config.ping_grace = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "FITPOOL_QUEUE_CAPACITY")? {
            config.queue_capacity = n as usize;
        }
        if let Some(ms) = parse_var(&lookup, "FITPOOL_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the number of workers
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Set the result timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the idle interval
    pub fn with_timestep(mut self, timestep: Duration) -> Self {
        self.timestep = timestep;
        self
    }

    /// Set the ping grace period
    pub fn with_ping_grace(mut self, grace: Duration) -> Self {
        self.ping_grace = grace;
        self
    }

    /// Set the load-balanced queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "num_workers must be greater than zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".into()));
        }
        if self.queue_capacity < self.num_workers {
            return Err(ConfigError::Invalid(format!(
                "queue_capacity ({}) must hold at least one job per worker ({})",
                self.queue_capacity, self.num_workers
            )));
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
