//! `TallyIO` Reporting Configuration
//!
//! Store, writer and query settings plus an optional declarative schema of
//! metrics, filters and retainers registered at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ReportingError, ReportingResult};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TALLYIO_REPORTING";

/// Main configuration for reporting
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReportingConfig {
    /// Store configuration
    pub store: StoreConfig,

    /// Writer configuration
    pub writer: WriterConfig,

    /// Query configuration
    pub query: QueryConfig,

    /// Metrics, filters and retainers registered at startup
    pub schema: SchemaConfig,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process ordered map
    Memory,
    /// Embedded redb database
    Redb,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend used for aggregate cells
    pub backend: StoreBackend,

    /// Database file path (None for in-memory redb)
    pub database_path: Option<PathBuf>,

    /// Cache size in bytes
    pub cache_size_bytes: u64,

    /// Cell transactions slower than this are logged as warnings
    pub slow_transaction_warn_ms: u64,

    /// Retry policy for cell transactions
    pub retry: RetryConfig,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial retry delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

/// Writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum number of cell transactions in flight per save call
    pub max_in_flight_updates: usize,

    /// Log a warning when a save call takes longer than this
    pub slow_save_warn_ms: u64,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Upper bound on buckets enumerated for gap filling
    pub max_buckets: usize,
}

/// Declarative schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Metrics to register
    pub metrics: Vec<MetricSchema>,

    /// Filters to register
    pub filters: Vec<FilterSchema>,

    /// Retainers to enable
    pub retainers: Vec<RetainerSchema>,
}

/// Metric declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSchema {
    /// Metric name
    pub name: String,
    /// Evaluator names
    pub evaluators: Vec<String>,
}

/// Filter declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSchema {
    /// Filter name
    pub name: String,
    /// Field names composing the filter key
    pub fields: Vec<String>,
}

/// Retainer declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainerSchema {
    /// Granularity name (second, minute, hour, day)
    pub granularity: String,
    /// Retained metric
    pub metric: String,
    /// Retained evaluators
    pub evaluators: Vec<String>,
}

impl ReportingConfig {
    /// Parse configuration from a TOML document
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document is malformed or invalid
    pub fn from_toml_str(document: &str) -> ReportingResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with `TALLYIO_REPORTING__*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or is invalid
    pub fn load(path: impl AsRef<Path>) -> ReportingResult<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;

        tracing::info!("Loaded reporting configuration from {}", path.display());
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid value
    pub fn validate(&self) -> ReportingResult<()> {
        if self.writer.max_in_flight_updates == 0 {
            return Err(ReportingError::configuration(
                "writer.max_in_flight_updates must be > 0",
            ));
        }
        if self.query.max_buckets == 0 {
            return Err(ReportingError::configuration(
                "query.max_buckets must be > 0",
            ));
        }
        if !self.store.retry.backoff_multiplier.is_finite()
            || self.store.retry.backoff_multiplier < 1.0_f64
        {
            return Err(ReportingError::configuration(
                "store.retry.backoff_multiplier must be >= 1.0",
            ));
        }
        if self.store.retry.initial_delay_ms > self.store.retry.max_delay_ms {
            return Err(ReportingError::configuration(
                "store.retry.initial_delay_ms must not exceed store.retry.max_delay_ms",
            ));
        }
        if self.store.backend == StoreBackend::Memory && self.store.database_path.is_some() {
            tracing::warn!("store.database_path is ignored by the memory backend");
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_path: None,
            cache_size_bytes: 67_108_864, // 64MB
            slow_transaction_warn_ms: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_in_flight_updates: 64,
            slow_save_warn_ms: 100,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_buckets: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[store]
backend = "redb"
database_path = "./data/reporting/cells.redb"
slow_transaction_warn_ms = 25

[store.retry]
max_retries = 5

[writer]
max_in_flight_updates = 16

[[schema.metrics]]
name = "value"
evaluators = ["sum", "diff"]

[[schema.filters]]
name = "custom"
fields = ["mode"]

[[schema.retainers]]
granularity = "minute"
metric = "value"
evaluators = ["sum"]
"#;

    #[test]
    fn test_defaults_are_valid() -> ReportingResult<()> {
        ReportingConfig::default().validate()
    }

    #[test]
    fn test_from_toml_str() -> ReportingResult<()> {
        let config = ReportingConfig::from_toml_str(SAMPLE)?;
        assert_eq!(config.store.backend, StoreBackend::Redb);
        assert_eq!(config.store.slow_transaction_warn_ms, 25);
        assert_eq!(config.store.retry.max_retries, 5);
        assert_eq!(config.store.retry.initial_delay_ms, 10);
        assert_eq!(config.writer.max_in_flight_updates, 16);
        assert_eq!(config.query.max_buckets, 1_000_000);
        assert_eq!(config.schema.metrics.len(), 1);
        assert_eq!(config.schema.filters[0].fields, vec!["mode".to_string()]);
        assert_eq!(config.schema.retainers[0].granularity, "minute");
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let result = ReportingConfig::from_toml_str("[writer]\nmax_in_flight_updates = 0\n");
        assert!(matches!(result, Err(ReportingError::Configuration { .. })));

        let result = ReportingConfig::from_toml_str("[store]\nbackend = \"cassandra\"\n");
        assert!(matches!(result, Err(ReportingError::Configuration { .. })));
    }

    #[test]
    fn test_load_from_file() -> ReportingResult<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(SAMPLE.as_bytes())?;

        let config = ReportingConfig::load(file.path())?;
        assert_eq!(config.schema.metrics[0].evaluators, vec!["sum", "diff"]);
        Ok(())
    }
}
