use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_EXPRESS__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// This node's shard. Campaigns and enrollments are partitioned by id.
    #[serde(default)]
    pub shard_index: u32,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_dispatch_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionConfig {
    #[serde(default = "default_resolution_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_resolution_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_overview_window_days")]
    pub overview_window_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_max_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_feed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_shard_count() -> u32 {
    1
}
fn default_max_concurrency() -> usize {
    32
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_dispatch_max_attempts() -> u32 {
    3
}
fn default_base_retry_delay_ms() -> u64 {
    200
}
fn default_max_retry_delay_ms() -> u64 {
    5000
}
fn default_retry_jitter_factor() -> f64 {
    0.1
}
fn default_resolution_timeout_ms() -> u64 {
    10_000
}
fn default_resolution_max_attempts() -> u32 {
    5
}
fn default_base_backoff_secs() -> u64 {
    60
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_overview_window_days() -> u32 {
    30
}
fn default_recovery_max_concurrency() -> usize {
    16
}
fn default_channel_capacity() -> usize {
    100_000
}
fn default_feed_batch_size() -> usize {
    500
}
fn default_flush_interval_ms() -> u64 {
    250
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            shard_index: 0,
            shard_count: default_shard_count(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            send_timeout_ms: default_send_timeout_ms(),
            max_attempts: default_dispatch_max_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            retry_jitter_factor: default_retry_jitter_factor(),
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_resolution_timeout_ms(),
            max_attempts: default_resolution_max_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            overview_window_days: default_overview_window_days(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_recovery_max_concurrency(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            batch_size: default_feed_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            resolution: ResolutionConfig::default(),
            analytics: AnalyticsConfig::default(),
            recovery: RecoveryConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Whether an entity id belongs to this node's shard.
    pub fn owns(&self, id: &uuid::Uuid) -> bool {
        let count = self.shard_count.max(1) as u128;
        id.as_u128() % count == u128::from(self.shard_index) % count
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, then environment
    /// variables. Environment values win.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_EXPRESS")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> crate::CampaignResult<()> {
        if self.scheduler.shard_count == 0 {
            return Err(crate::CampaignError::Config(
                "scheduler.shard_count must be at least 1".into(),
            ));
        }
        if self.scheduler.shard_index >= self.scheduler.shard_count {
            return Err(crate::CampaignError::Config(format!(
                "scheduler.shard_index {} out of range for {} shards",
                self.scheduler.shard_index, self.scheduler.shard_count
            )));
        }
        if self.dispatch.max_concurrency == 0 || self.recovery.max_concurrency == 0 {
            return Err(crate::CampaignError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(crate::CampaignError::Config(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.analytics.overview_window_days, 30);
        assert_eq!(config.scheduler.shard_count, 1);
    }

    #[test]
    fn test_single_shard_owns_everything() {
        let config = SchedulerConfig::default();
        for _ in 0..16 {
            assert!(config.owns(&uuid::Uuid::new_v4()));
        }
    }

    #[test]
    fn test_shards_partition_ids() {
        let a = SchedulerConfig {
            shard_index: 0,
            shard_count: 2,
            ..Default::default()
        };
        let b = SchedulerConfig {
            shard_index: 1,
            shard_count: 2,
            ..Default::default()
        };
        for _ in 0..32 {
            let id = uuid::Uuid::new_v4();
            assert_ne!(a.owns(&id), b.owns(&id));
        }
    }

    #[test]
    fn test_rejects_bad_shard_index() {
        let mut config = AppConfig::default();
        config.scheduler.shard_index = 3;
        config.scheduler.shard_count = 2;
        assert!(config.validate().is_err());
    }
}
