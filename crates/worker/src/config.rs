// Worker and pipeline configuration
//
// Loaded from environment variables (after dotenvy has read .env).
// Decision: PipelineConfig travels inside the workflow input, so a replayed
// execution sees the thresholds it was started with, not the current env.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use txflow_durable::EngineConfig;
use uuid::Uuid;

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?}")]
    Unparsable { name: &'static str, value: String },

    #[error("{name}: {reason}")]
    OutOfRange {
        name: &'static str,
        reason: String,
    },
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Unparsable { name, value }),
        _ => Ok(None),
    }
}

fn out_of_range(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        name,
        reason: reason.into(),
    }
}

// =============================================================================
// WorkerConfig
// =============================================================================

/// Process-level configuration of the worker binary
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID (unique identifier for this worker instance)
    pub worker_id: String,
    /// PostgreSQL event store; in-memory when unset
    pub database_url: Option<String>,
    /// Maximum concurrently running activity attempts
    pub max_concurrent_activities: usize,
    /// How long terminal executions stay live before eviction
    pub execution_retention: Duration,
    /// Length of the simulated embedding vectors
    pub embedding_dimensions: usize,
    /// Decision pipeline thresholds and tunables
    pub pipeline: PipelineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            database_url: None,
            max_concurrent_activities: 64,
            execution_retention: Duration::from_secs(3600),
            embedding_dimensions: 1024,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`: Worker identifier (default: generated)
    /// - `DATABASE_URL`: PostgreSQL connection string (default: in-memory store)
    /// - `MAX_CONCURRENT_ACTIVITIES`: Activity concurrency bound (default: 64)
    /// - `EXECUTION_RETENTION_SECS`: Retention of terminal executions (default: 3600)
    /// - `EMBEDDING_DIMENSIONS`: Embedding vector length (default: 1024)
    /// - plus everything [`PipelineConfig::from_env`] reads
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            worker_id: lookup("WORKER_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_concurrent_activities: parse_var(&lookup, "MAX_CONCURRENT_ACTIVITIES")?
                .unwrap_or(defaults.max_concurrent_activities),
            execution_retention: parse_var(&lookup, "EXECUTION_RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.execution_retention),
            embedding_dimensions: parse_var(&lookup, "EMBEDDING_DIMENSIONS")?
                .unwrap_or(defaults.embedding_dimensions),
            pipeline: PipelineConfig::from_lookup(&lookup)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_activities == 0 {
            return Err(out_of_range("MAX_CONCURRENT_ACTIVITIES", "must be at least 1"));
        }
        if self.embedding_dimensions == 0 {
            return Err(out_of_range("EMBEDDING_DIMENSIONS", "must be at least 1"));
        }
        self.pipeline.validate()
    }

    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_worker_id(self.worker_id.clone())
            .with_max_concurrent_activities(self.max_concurrent_activities)
            .with_retention_window(self.execution_retention)
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Thresholds and tunables of the decision pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// AI confidence (0-100) below which a human must review
    pub confidence_threshold_approve: f64,

    /// Amount above which a human must review
    pub auto_approval_limit: f64,

    /// Deadline of the human review wait point
    #[serde(with = "duration_millis")]
    pub human_review_timeout: Duration,

    /// Upper bound of similar cases handed to the analysis
    pub max_similar_cases: usize,

    /// Minimum cosine similarity of a similar case
    pub similarity_threshold: f64,

    /// Heartbeat cadence of the AI analysis; the liveness window is three beats
    #[serde(with = "duration_millis")]
    pub ai_heartbeat_interval: Duration,

    /// First retry delay; per-step policies scale from it
    #[serde(with = "duration_millis")]
    pub retry_initial_interval: Duration,

    /// Cap on retry delays
    #[serde(with = "duration_millis")]
    pub retry_max_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold_approve: 85.0,
            auto_approval_limit: 50_000.0,
            human_review_timeout: Duration::from_secs(7 * 24 * 3600),
            max_similar_cases: 10,
            similarity_threshold: 0.75,
            ai_heartbeat_interval: Duration::from_secs(5),
            retry_initial_interval: Duration::from_secs(1),
            retry_max_interval: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `CONFIDENCE_THRESHOLD_APPROVE`: Auto-approval confidence floor (default: 85)
    /// - `AUTO_APPROVAL_LIMIT`: Auto-approval amount ceiling (default: 50000)
    /// - `HUMAN_REVIEW_TIMEOUT_SECS`: Human review deadline (default: 7 days)
    /// - `MAX_SIMILAR_CASES`: Similar cases considered (default: 10)
    /// - `SIMILARITY_THRESHOLD`: Minimum similarity (default: 0.75)
    /// - `AI_HEARTBEAT_INTERVAL_MS`: AI analysis heartbeat cadence (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name: &str| std::env::var(name).ok())
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            confidence_threshold_approve: parse_var(lookup, "CONFIDENCE_THRESHOLD_APPROVE")?
                .unwrap_or(defaults.confidence_threshold_approve),
            auto_approval_limit: parse_var(lookup, "AUTO_APPROVAL_LIMIT")?
                .unwrap_or(defaults.auto_approval_limit),
            human_review_timeout: parse_var(lookup, "HUMAN_REVIEW_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.human_review_timeout),
            max_similar_cases: parse_var(lookup, "MAX_SIMILAR_CASES")?
                .unwrap_or(defaults.max_similar_cases),
            similarity_threshold: parse_var(lookup, "SIMILARITY_THRESHOLD")?
                .unwrap_or(defaults.similarity_threshold),
            ai_heartbeat_interval: parse_var(lookup, "AI_HEARTBEAT_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.ai_heartbeat_interval),
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.confidence_threshold_approve) {
            return Err(out_of_range(
                "CONFIDENCE_THRESHOLD_APPROVE",
                format!("must be within 0..=100, got {}", self.confidence_threshold_approve),
            ));
        }
        if !self.auto_approval_limit.is_finite() || self.auto_approval_limit < 0.0 {
            return Err(out_of_range("AUTO_APPROVAL_LIMIT", "must be a non-negative amount"));
        }
        if self.human_review_timeout.is_zero() {
            return Err(out_of_range("HUMAN_REVIEW_TIMEOUT_SECS", "must be positive"));
        }
        if self.max_similar_cases == 0 {
            return Err(out_of_range("MAX_SIMILAR_CASES", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(out_of_range(
                "SIMILARITY_THRESHOLD",
                format!("must be within 0..=1, got {}", self.similarity_threshold),
            ));
        }
        if self.ai_heartbeat_interval.is_zero() {
            return Err(out_of_range("AI_HEARTBEAT_INTERVAL_MS", "must be positive"));
        }
        if self.retry_initial_interval > self.retry_max_interval {
            return Err(out_of_range(
                "retry_initial_interval",
                "must not exceed retry_max_interval",
            ));
        }
        Ok(())
    }

    /// Liveness window of the AI analysis
    pub fn ai_heartbeat_timeout(&self) -> Duration {
        self.ai_heartbeat_interval * 3
    }

    /// Shrink all retry delays, for tests and local runs
    pub fn with_retry_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_interval = initial;
        self.retry_max_interval = max;
        self
    }

    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.human_review_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.ai_heartbeat_interval = interval;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
