// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (CEREBRO_ prefix, `__` nesting)
// - Validation
// - Defaults mirroring the crate constants
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::ObservationWindow;
use crate::*;

/// Prefix of environment overrides, e.g. `CEREBRO_UPSTREAM__API_KEY`
pub const ENV_PREFIX: &str = "CEREBRO_";

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the ingestion pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Remote telemetry API
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Request spacing, backoff and circuit breaker
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Per-query retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Discovery and collection
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Snapshot cache and refresh cycle
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl IngestConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::extract(figment)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.upstream.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid_value(
                "upstream.endpoint",
                format!("'{}' is not an http(s) URL", endpoint),
            ));
        }
        if self.upstream.request_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "upstream.request_timeout",
                "Request timeout must be greater than zero",
            ));
        }

        if self.admission.backoff_base < 1.0 {
            return Err(ConfigError::invalid_value(
                "admission.backoff_base",
                "Backoff base must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.admission.jitter_ratio) {
            return Err(ConfigError::invalid_value(
                "admission.jitter_ratio",
                "Jitter ratio must be within [0, 1]",
            ));
        }
        if self.admission.failure_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "admission.failure_threshold",
                "Failure threshold must be at least 1",
            ));
        }
        if self.admission.half_open_successes == 0 {
            return Err(ConfigError::invalid_value(
                "admission.half_open_successes",
                "At least one half-open success is required to close the circuit",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "retry.max_attempts",
                "At least one attempt is required",
            ));
        }
        if self.retry.rate_limit_base > self.retry.rate_limit_cap {
            return Err(ConfigError::invalid_value(
                "retry.rate_limit_base",
                "Rate-limit backoff base exceeds its cap",
            ));
        }
        if self.retry.server_error_base > self.retry.server_error_cap {
            return Err(ConfigError::invalid_value(
                "retry.server_error_base",
                "Server-error backoff base exceeds its cap",
            ));
        }

        if self.catalog.page_limit == 0 {
            return Err(ConfigError::invalid_value(
                "catalog.page_limit",
                "Page limit must be at least 1",
            ));
        }
        if self.catalog.windows.is_empty() {
            return Err(ConfigError::invalid_value(
                "catalog.windows",
                "At least one observation window is required",
            ));
        }
        if self.catalog.concurrency == 0 {
            return Err(ConfigError::invalid_value(
                "catalog.concurrency",
                "Concurrency must be at least 1",
            ));
        }

        if self.cache.refresh_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "cache.refresh_interval",
                "Refresh interval must be greater than zero",
            ));
        }
        if self.cache.refresh_deadline.is_zero() {
            return Err(ConfigError::invalid_value(
                "cache.refresh_deadline",
                "Refresh deadline must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Credentials are only needed when talking to the network, so they are
    /// checked separately from `validate`.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        match self.upstream.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(ConfigError::missing_field("upstream.api_key")),
        }
        if self.upstream.account_id.is_none() {
            return Err(ConfigError::missing_field("upstream.account_id"));
        }
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Upstream Configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// GraphQL endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Static API key, sent as `Api-Key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Account every query is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<u64>,

    /// Timeout of a single request
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            account_id: None,
            request_timeout: default_request_timeout(),
        }
    }
}

// Keeps the key out of debug logs.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("account_id", &self.account_id)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn default_endpoint() -> String {
    DEFAULT_UPSTREAM_ENDPOINT.into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// Admission Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Minimum spacing between two admissions
    #[serde(default = "default_min_spacing", with = "humantime_serde")]
    pub min_spacing: Duration,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    #[serde(default = "default_backoff_exponent_cap")]
    pub backoff_exponent_cap: u32,

    /// Ceiling for the adaptive delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Failure tally that opens the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cool_down", with = "humantime_serde")]
    pub cool_down: Duration,

    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,

    /// Adaptive delay applies once the tally exceeds this
    #[serde(default = "default_backoff_after_failures")]
    pub backoff_after_failures: u32,

    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_spacing: default_min_spacing(),
            backoff_base: default_backoff_base(),
            backoff_exponent_cap: default_backoff_exponent_cap(),
            max_delay: default_max_delay(),
            failure_threshold: default_failure_threshold(),
            cool_down: default_cool_down(),
            half_open_successes: default_half_open_successes(),
            backoff_after_failures: default_backoff_after_failures(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

fn default_min_spacing() -> Duration {
    Duration::from_millis(DEFAULT_MIN_SPACING_MS)
}

fn default_backoff_base() -> f64 {
    DEFAULT_BACKOFF_BASE
}

fn default_backoff_exponent_cap() -> u32 {
    DEFAULT_BACKOFF_EXPONENT_CAP
}

fn default_max_delay() -> Duration {
    Duration::from_secs(DEFAULT_MAX_ADMISSION_DELAY_SECS)
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cool_down() -> Duration {
    Duration::from_secs(DEFAULT_COOL_DOWN_SECS)
}

fn default_half_open_successes() -> u32 {
    DEFAULT_HALF_OPEN_SUCCESSES
}

fn default_backoff_after_failures() -> u32 {
    DEFAULT_BACKOFF_AFTER_FAILURES
}

fn default_jitter_ratio() -> f64 {
    DEFAULT_JITTER_RATIO
}

// ----------------------------------------------------------------------------
// Retry Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per query, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Throttling backoff without a retry hint; doubles per attempt
    #[serde(default = "default_rate_limit_base", with = "humantime_serde")]
    pub rate_limit_base: Duration,

    /// Cap on throttling backoff and on honoured `Retry-After`
    #[serde(default = "default_rate_limit_cap", with = "humantime_serde")]
    pub rate_limit_cap: Duration,

    #[serde(default = "default_server_error_base", with = "humantime_serde")]
    pub server_error_base: Duration,

    #[serde(default = "default_server_error_cap", with = "humantime_serde")]
    pub server_error_cap: Duration,

    /// Backoff after timeouts and connection errors; doubles per attempt
    #[serde(default = "default_transport_base", with = "humantime_serde")]
    pub transport_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rate_limit_base: default_rate_limit_base(),
            rate_limit_cap: default_rate_limit_cap(),
            server_error_base: default_server_error_base(),
            server_error_cap: default_server_error_cap(),
            transport_base: default_transport_base(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_rate_limit_base() -> Duration {
    Duration::from_secs(DEFAULT_RATE_LIMIT_BACKOFF_SECS)
}

fn default_rate_limit_cap() -> Duration {
    Duration::from_secs(DEFAULT_RATE_LIMIT_BACKOFF_CAP_SECS)
}

fn default_server_error_base() -> Duration {
    Duration::from_secs(DEFAULT_SERVER_ERROR_BACKOFF_SECS)
}

fn default_server_error_cap() -> Duration {
    Duration::from_secs(DEFAULT_SERVER_ERROR_BACKOFF_CAP_SECS)
}

fn default_transport_base() -> Duration {
    Duration::from_secs(DEFAULT_TRANSPORT_BACKOFF_SECS)
}

// ----------------------------------------------------------------------------
// Catalog Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Safety cap on discovery pages
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Windows every metric group is collected over
    #[serde(default = "default_windows")]
    pub windows: Vec<ObservationWindow>,

    /// Entities collected in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            windows: default_windows(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_page_limit() -> u32 {
    DEFAULT_DISCOVERY_PAGE_LIMIT
}

fn default_windows() -> Vec<ObservationWindow> {
    ObservationWindow::ALL.to_vec()
}

fn default_concurrency() -> usize {
    DEFAULT_COLLECTION_CONCURRENCY
}

// ----------------------------------------------------------------------------
// Cache Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Durable snapshot location
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Bound on collection within one refresh
    #[serde(default = "default_refresh_deadline", with = "humantime_serde")]
    pub refresh_deadline: Duration,

    /// Time an in-flight refresh gets to finish on shutdown
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            refresh_interval: default_refresh_interval(),
            refresh_deadline: default_refresh_deadline(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_PATH)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)
}

fn default_refresh_deadline() -> Duration {
    Duration::from_secs(DEFAULT_REFRESH_DEADLINE_SECS)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_match_constants() {
        let config = IngestConfig::default();
        assert_eq!(config.admission.min_spacing, Duration::from_secs(1));
        assert_eq!(config.admission.failure_threshold, 10);
        assert_eq!(config.admission.cool_down, Duration::from_secs(60));
        assert_eq!(config.admission.half_open_successes, 3);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.rate_limit_cap, Duration::from_secs(300));
        assert_eq!(config.catalog.windows, ObservationWindow::ALL.to_vec());
        assert_eq!(config.catalog.concurrency, 5);
        assert_eq!(config.cache.refresh_interval, Duration::from_secs(3600));
        assert_eq!(config.cache.refresh_deadline, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = IngestConfig::from_str(
            r#"
            [upstream]
            api_key = "NRAK-test"
            account_id = 1234567

            [admission]
            min_spacing = "250ms"

            [catalog]
            windows = ["30min", "7d"]
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.account_id, Some(1_234_567));
        assert_eq!(config.admission.min_spacing, Duration::from_millis(250));
        assert_eq!(config.admission.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(
            config.catalog.windows,
            vec![ObservationWindow::Last30Minutes, ObservationWindow::Last7Days]
        );
        assert!(config.validate_credentials().is_ok());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            ("[retry]\nmax_attempts = 0", "retry.max_attempts"),
            ("[catalog]\nconcurrency = 0", "catalog.concurrency"),
            ("[catalog]\nwindows = []", "catalog.windows"),
            ("[admission]\njitter_ratio = 1.5", "admission.jitter_ratio"),
            ("[cache]\nrefresh_interval = \"0s\"", "cache.refresh_interval"),
            ("[upstream]\nendpoint = \"ftp://example\"", "upstream.endpoint"),
        ];
        for (toml_str, expected_field) in cases {
            match IngestConfig::from_str(toml_str) {
                Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected invalid {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn test_unknown_window_is_parse_error() {
        let result = IngestConfig::from_str("[catalog]\nwindows = [\"1h\"]");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_credentials_required_for_network() {
        let mut config = IngestConfig::default();
        assert!(matches!(
            config.validate_credentials(),
            Err(ConfigError::MissingField { field }) if field == "upstream.api_key"
        ));

        config.upstream.api_key = Some("key".into());
        assert!(matches!(
            config.validate_credentials(),
            Err(ConfigError::MissingField { field }) if field == "upstream.account_id"
        ));
    }

    #[test]
    fn test_api_key_redacted_in_debug() {
        let mut config = IngestConfig::default();
        config.upstream.api_key = Some("NRAK-secret".into());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("NRAK-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = IngestConfig::generate_default_config();
        assert!(generated.contains("[admission]"));
        let parsed = IngestConfig::from_str(&generated).unwrap();
        assert_eq!(parsed.cache.snapshot_path, PathBuf::from(DEFAULT_SNAPSHOT_PATH));
        assert_eq!(parsed.retry.server_error_cap, Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[catalog]\npage_limit = 7").unwrap();
        let config = IngestConfig::load(file.path()).unwrap();
        assert_eq!(config.catalog.page_limit, 7);

        let missing = IngestConfig::load("/definitely/not/here.toml");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }
}
