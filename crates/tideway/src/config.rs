// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine and queue configuration.
//!
//! [`EngineConfig`] can be loaded from environment variables or built
//! programmatically. Queues are declared by the embedding application via
//! [`QueueConfig`]; they are configuration, not persisted rows.

use std::time::Duration;

use uuid::Uuid;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database connection URL, if supplied via environment. The embedding
    /// application owns connection setup; this is carried for convenience.
    pub database_url: Option<String>,
    /// Identity of this executor process. Stamped on claimed/owned runs and
    /// used by crash recovery to find runs stranded by a previous incarnation.
    pub executor_id: String,
    /// Maximum recovery attempts before a run is finalized as
    /// `max_recovery_attempts_exceeded`.
    pub max_recovery_attempts: i32,
    /// Queue dispatcher poll interval (jittered per tick).
    pub queue_poll_interval: Duration,
    /// Event bus poll-fallback interval (jittered per tick). Deliberately
    /// long: the push path provides latency, polling provides convergence.
    pub event_poll_interval: Duration,
    /// Transient store-error retry: maximum attempts per call.
    pub store_retry_attempts: u32,
    /// Transient store-error retry: base backoff delay, doubled per attempt
    /// with jitter.
    pub store_retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            executor_id: Uuid::new_v4().to_string(),
            max_recovery_attempts: 5,
            queue_poll_interval: Duration::from_millis(1000),
            event_poll_interval: Duration::from_millis(2000),
            store_retry_attempts: 3,
            store_retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TIDEWAY_DATABASE_URL`: connection string, passed through to the app
    /// - `TIDEWAY_EXECUTOR_ID`: executor identity (default: random UUID)
    /// - `TIDEWAY_MAX_RECOVERY_ATTEMPTS`: recovery cap (default: 5)
    /// - `TIDEWAY_QUEUE_POLL_INTERVAL_MS`: dispatcher interval (default: 1000)
    /// - `TIDEWAY_EVENT_POLL_INTERVAL_MS`: bus poll interval (default: 2000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("TIDEWAY_DATABASE_URL").ok();

        if let Ok(id) = std::env::var("TIDEWAY_EXECUTOR_ID") {
            if id.is_empty() {
                return Err(ConfigError::Invalid(
                    "TIDEWAY_EXECUTOR_ID",
                    "must not be empty",
                ));
            }
            config.executor_id = id;
        }

        if let Ok(raw) = std::env::var("TIDEWAY_MAX_RECOVERY_ATTEMPTS") {
            config.max_recovery_attempts = raw.parse().map_err(|_| {
                ConfigError::Invalid("TIDEWAY_MAX_RECOVERY_ATTEMPTS", "must be an integer")
            })?;
        }

        if let Ok(raw) = std::env::var("TIDEWAY_QUEUE_POLL_INTERVAL_MS") {
            let ms: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid("TIDEWAY_QUEUE_POLL_INTERVAL_MS", "must be milliseconds")
            })?;
            config.queue_poll_interval = Duration::from_millis(ms);
        }

        if let Ok(raw) = std::env::var("TIDEWAY_EVENT_POLL_INTERVAL_MS") {
            let ms: u64 = raw.parse().map_err(|_| {
                ConfigError::Invalid("TIDEWAY_EVENT_POLL_INTERVAL_MS", "must be milliseconds")
            })?;
            config.event_poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

/// Rate limit for a queue: at most `limit` runs started within any trailing
/// `period` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum number of runs started within the window.
    pub limit: i64,
    /// Trailing window length.
    pub period: Duration,
}

/// Declared configuration of one queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, referenced by enqueue operations.
    pub name: String,
    /// Cap on concurrently-pending runs across all executors. `None` means
    /// unbounded.
    pub global_concurrency: Option<i64>,
    /// Cap on concurrently-pending runs owned by one executor. `None` means
    /// unbounded.
    pub worker_concurrency: Option<i64>,
    /// Optional trailing-window rate limit on run starts.
    pub rate_limit: Option<RateLimit>,
    /// When true, dequeue order honors the run's priority (lower value first)
    /// before creation time.
    pub priority_enabled: bool,
    /// When true, each distinct partition key is its own independent
    /// concurrency/rate domain.
    pub partitioned: bool,
}

impl QueueConfig {
    /// A queue with the given name and no limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global_concurrency: None,
            worker_concurrency: None,
            rate_limit: None,
            priority_enabled: false,
            partitioned: false,
        }
    }

    /// Set the queue-wide concurrency cap.
    pub fn with_global_concurrency(mut self, limit: i64) -> Self {
        self.global_concurrency = Some(limit);
        self
    }

    /// Set the per-executor concurrency cap.
    pub fn with_worker_concurrency(mut self, limit: i64) -> Self {
        self.worker_concurrency = Some(limit);
        self
    }

    /// Set a trailing-window rate limit.
    pub fn with_rate_limit(mut self, limit: i64, period: Duration) -> Self {
        self.rate_limit = Some(RateLimit { limit, period });
        self
    }

    /// Honor run priority when dequeuing.
    pub fn with_priority(mut self) -> Self {
        self.priority_enabled = true;
        self
    }

    /// Treat each partition key as an independent concurrency domain.
    pub fn with_partitioning(mut self) -> Self {
        self.partitioned = true;
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
