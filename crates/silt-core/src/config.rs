//! Configuration management for Silt
//!
//! Sources, lowest to highest precedence:
//! - hardcoded defaults
//! - `/etc/silt/silt.*`, then `./config/silt.*`
//! - the file named by `SILT_CONFIG`
//! - environment variables (`SILT__COMPACTION__DELETE_RATIO_THRESHOLD=0.3`)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure for Silt
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SiltConfig {
    #[serde(default)]
    pub segment: SegmentConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SiltConfig {
    /// Load configuration from every source, highest precedence last.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        builder = builder
            .add_source(File::with_name("/etc/silt/silt").required(false))
            .add_source(File::with_name("./config/silt").required(false));

        if let Ok(config_path) = std::env::var("SILT_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder.add_source(Self::environment());

        let config: SiltConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path on top of the defaults.
    /// `SILT__*` environment variables still take precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: SiltConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix("SILT")
            .separator("__")
            .try_parsing(true)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = Self::default();
        builder
            .set_default("segment.max_rows", defaults.segment.max_rows)?
            .set_default(
                "segment.row_cache_capacity",
                defaults.segment.row_cache_capacity,
            )?
            .set_default("compaction.enable_auto", defaults.compaction.enable_auto)?
            .set_default(
                "compaction.delete_ratio_threshold",
                defaults.compaction.delete_ratio_threshold,
            )?
            .set_default(
                "compaction.max_delta_records",
                defaults.compaction.max_delta_records,
            )?
            .set_default(
                "compaction.segment_count_threshold",
                defaults.compaction.segment_count_threshold as u64,
            )?
            .set_default(
                "compaction.small_segment_proportion",
                defaults.compaction.small_segment_proportion,
            )?
            .set_default(
                "compaction.max_compaction_interval_secs",
                defaults.compaction.max_compaction_interval_secs,
            )?
            .set_default(
                "compaction.trigger_interval_ms",
                defaults.compaction.trigger_interval_ms,
            )?
            .set_default(
                "compaction.max_parallel_plans",
                defaults.compaction.max_parallel_plans as u64,
            )?
            .set_default(
                "compaction.plan_history_secs",
                defaults.compaction.plan_history_secs,
            )?
            .set_default(
                "retention.retention_duration_secs",
                defaults.retention.retention_duration_secs,
            )?
            .set_default(
                "client.default_wait_timeout_ms",
                defaults.client.default_wait_timeout_ms,
            )?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.format", defaults.logging.format)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment.max_rows == 0 {
            return Err(ConfigError::Message(
                "segment.max_rows must be > 0".to_string(),
            ));
        }

        if self.segment.row_cache_capacity == 0 {
            return Err(ConfigError::Message(
                "segment.row_cache_capacity must be > 0".to_string(),
            ));
        }

        self.compaction.validate()?;

        if self.client.default_wait_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "client.default_wait_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Segment sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentConfig {
    /// Rows at which a growing segment seals itself; also the "max segment size"
    pub max_rows: u64,

    /// Decoded insert logs kept in memory for readers and compaction
    pub row_cache_capacity: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_rows: 65_536,
            row_cache_capacity: 256,
        }
    }
}

/// Compaction trigger policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    /// Run the automatic trigger loop
    pub enable_auto: bool,

    /// Applicable deletes / rows at which a segment gets a delta-merge plan
    pub delete_ratio_threshold: f64,

    /// Applicable deletes at which a segment gets a delta-merge plan regardless of ratio
    pub max_delta_records: u64,

    /// Number of small segments in one bucket that triggers an automatic merge
    pub segment_count_threshold: usize,

    /// A segment is small below this fraction of `segment.max_rows`
    pub small_segment_proportion: f64,

    /// Buckets idle for longer than this are force-merged
    pub max_compaction_interval_secs: u64,

    /// Tick of the automatic trigger loop
    pub trigger_interval_ms: u64,

    /// Upper bound on concurrently executing plans
    pub max_parallel_plans: usize,

    /// Terminal plan records and plan groups older than this are forgotten
    pub plan_history_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enable_auto: true,
            delete_ratio_threshold: 0.2,
            max_delta_records: 200_000,
            segment_count_threshold: 10,
            small_segment_proportion: 0.5,
            max_compaction_interval_secs: 60,
            trigger_interval_ms: 1000,
            max_parallel_plans: 8,
            plan_history_secs: 3600,
        }
    }
}

impl CompactionConfig {
    /// Validate the policy section on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.delete_ratio_threshold > 0.0 && self.delete_ratio_threshold <= 1.0) {
            return Err(ConfigError::Message(
                "compaction.delete_ratio_threshold must be in (0, 1]".to_string(),
            ));
        }
        if self.max_delta_records == 0 {
            return Err(ConfigError::Message(
                "compaction.max_delta_records must be > 0".to_string(),
            ));
        }
        if self.segment_count_threshold < 2 {
            return Err(ConfigError::Message(
                "compaction.segment_count_threshold must be >= 2".to_string(),
            ));
        }
        if !(self.small_segment_proportion > 0.0 && self.small_segment_proportion <= 1.0) {
            return Err(ConfigError::Message(
                "compaction.small_segment_proportion must be in (0, 1]".to_string(),
            ));
        }
        if self.trigger_interval_ms == 0 {
            return Err(ConfigError::Message(
                "compaction.trigger_interval_ms must be > 0".to_string(),
            ));
        }
        if self.max_parallel_plans == 0 {
            return Err(ConfigError::Message(
                "compaction.max_parallel_plans must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_compaction_interval(&self) -> Duration {
        Duration::from_secs(self.max_compaction_interval_secs)
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_millis(self.trigger_interval_ms)
    }

    pub fn plan_history(&self) -> Duration {
        Duration::from_secs(self.plan_history_secs)
    }
}

/// Time-travel retention
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// How far back reads may travel; also the GC horizon for compacted sources
    pub retention_duration_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_duration_secs: 432_000, // 5 days
        }
    }
}

impl RetentionConfig {
    pub fn retention_duration(&self) -> Duration {
        Duration::from_secs(self.retention_duration_secs)
    }
}

/// Client-side defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Default bound for `wait_for_compaction_completed`
    pub default_wait_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}

/// Logging output
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,

    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
