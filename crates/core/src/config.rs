use chrono::Duration;
use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `SEQUENCES__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub sequences: SequenceConfig,
    #[serde(default)]
    pub delivery: DeliveryRetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ─── Sequence Config ────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Offset used instead of "now" for a zero-delay first step.
    #[serde(default = "default_first_step_grace_secs")]
    pub first_step_grace_secs: u64,
    /// How long a claimed enrollment stays reserved for one worker.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Sequence-level retry offset after a failed send.
    #[serde(default = "default_send_retry_offset_secs")]
    pub send_retry_offset_secs: u64,
    #[serde(default = "default_max_consecutive_skips")]
    pub max_consecutive_skips: usize,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default)]
    pub send_window: Option<SendWindowConfig>,
}

/// Hour-of-day / weekday window outside of which nothing is scheduled.
/// Hours are UTC; `start_hour > end_hour` wraps midnight.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendWindowConfig {
    #[serde(default = "default_window_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_window_end_hour")]
    pub end_hour: u32,
    #[serde(default)]
    pub skip_weekends: bool,
}

fn default_tick_interval_secs() -> u64 { 60 }
fn default_batch_limit() -> usize { 500 }
fn default_worker_concurrency() -> usize { 16 }
fn default_first_step_grace_secs() -> u64 { 300 }
fn default_claim_lease_secs() -> u64 { 600 }
fn default_send_retry_offset_secs() -> u64 { 1800 }
fn default_max_consecutive_skips() -> usize { 50 }
fn default_provider_timeout_secs() -> u64 { 30 }
fn default_window_start_hour() -> u32 { 8 }
fn default_window_end_hour() -> u32 { 20 }

impl SequenceConfig {
    pub fn first_step_grace(&self) -> Duration {
        secs(self.first_step_grace_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        secs(self.claim_lease_secs)
    }

    pub fn send_retry_offset(&self) -> Duration {
        secs(self.send_retry_offset_secs)
    }

    pub fn provider_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.provider_timeout_secs)
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            batch_limit: default_batch_limit(),
            worker_concurrency: default_worker_concurrency(),
            first_step_grace_secs: default_first_step_grace_secs(),
            claim_lease_secs: default_claim_lease_secs(),
            send_retry_offset_secs: default_send_retry_offset_secs(),
            max_consecutive_skips: default_max_consecutive_skips(),
            provider_timeout_secs: default_provider_timeout_secs(),
            send_window: None,
        }
    }
}

impl Default for SendWindowConfig {
    fn default() -> Self {
        Self {
            start_hour: default_window_start_hour(),
            end_hour: default_window_end_hour(),
            skip_weekends: false,
        }
    }
}

// ─── Delivery Retry Config ──────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_retry_batch_limit")]
    pub batch_limit: usize,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_backoff_secs() -> u64 { 60 }
fn default_max_backoff_secs() -> u64 { 21_600 }
fn default_retry_batch_limit() -> usize { 500 }

impl Default for DeliveryRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            batch_limit: default_retry_batch_limit(),
        }
    }
}

// ─── Metrics Config ─────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Serve the Prometheus scrape endpoint.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_host() -> String { "0.0.0.0".to_string() }
fn default_metrics_port() -> u16 { 9091 }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

fn default_node_id() -> String {
    "node-01".to_string()
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            sequences: SequenceConfig::default(),
            delivery: DeliveryRetryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("SEQUENCES")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.sequences.first_step_grace(), Duration::minutes(5));
        assert_eq!(config.sequences.max_consecutive_skips, 50);
        assert!(config.sequences.send_window.is_none());
        assert_eq!(config.delivery.max_attempts, 5);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"sequences": {"batch_limit": 10, "send_window": {"skip_weekends": true}}}"#,
        )
        .unwrap();
        assert_eq!(config.sequences.batch_limit, 10);
        assert_eq!(config.sequences.claim_lease_secs, 600);
        let window = config.sequences.send_window.unwrap();
        assert_eq!(window.start_hour, 8);
        assert!(window.skip_weekends);
        assert_eq!(config.node_id, "node-01");
    }
}
