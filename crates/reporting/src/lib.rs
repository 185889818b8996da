//! `TallyIO` Reporting - Metrics Aggregation and Retainer Queries
//!
//! This crate keeps running aggregates of raw data points, keyed by filter
//! dimensions, and optionally retains them per second, minute, hour or day so
//! callers can read a time series over an arbitrary range.

#![allow(clippy::significant_drop_tightening)] // Registry guards are scoped explicitly
#![allow(clippy::option_if_let_else)] // Pattern matching is clearer than map_or
#![allow(clippy::missing_errors_doc)] // Error documentation is handled at module level
#![allow(clippy::cast_precision_loss)] // Aggregates are f64 by definition
#![allow(clippy::missing_const_for_fn)] // Const functions not needed for builder methods
#![allow(clippy::module_name_repetitions)] // Store and config types carry their module name
//!
//! # Features
//!
//! - **Evaluators**: `sum`, `diff`, `count`, `min`, `max`, validated at registration
//! - **Filters**: aggregates per combination of declared field values
//! - **Retainers**: time-bucketed aggregates with zero gap filling on read
//! - **Stores**: in-process ordered map or embedded redb (`hot-storage` feature)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Reporting facade                        │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │   Registry   │    Writer    │    Query     │ Range Resolver │
//! │              │  (fan-out)   │  (builder)   │  (gap filling) │
//! ├──────────────┴──────────────┴──────────────┴────────────────┤
//! │        Key Builder (filter keys, buckets, cell paths)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │          MetricStore (memory / redb, atomic RMW)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use tallyio_reporting::{DataPoint, Granularity, Reporting};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reporting = Reporting::in_memory();
//!     reporting.add_metric("value", &["sum", "diff"])?;
//!     reporting.enable_retainer(Granularity::Minute, "value", &["sum"])?;
//!
//!     reporting.save_metric(DataPoint::new().with("value", 50)).await?;
//!
//!     let total = reporting.filter().sum("value").value().await?;
//!     assert_eq!(total, Some(50.0));
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// Public exports
pub use crate::config::*;
pub use crate::error::*;
pub use crate::types::*;

pub use evaluator::Evaluator;
pub use keys::Granularity;
pub use query::Query;
pub use registry::{Filter, Metric, Registry, Retainer, DEFAULT_FILTER};
pub use store::{
    KeyRange, MemoryStore, MemoryStoreStats, MetricStore, Snapshot, StorePath, UpdateFn,
};
#[cfg(feature = "hot-storage")]
pub use store::RedbStore;

// Internal modules
pub mod config;
pub mod error;
pub mod types;

pub mod evaluator;
pub mod keys;
pub mod query;
pub mod range;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod writer;

/// Main reporting interface for `TallyIO`
///
/// Cheap to clone; clones share the registry and the store.
#[derive(Debug)]
pub struct Reporting {
    inner: Arc<ReportingInner>,
}

#[derive(Debug)]
struct ReportingInner {
    config: ReportingConfig,
    store: Arc<dyn MetricStore>,
    registry: Arc<RwLock<Registry>>,
    writer: writer::Writer,
}

impl Reporting {
    /// Create a reporting instance from configuration
    ///
    /// Opens the configured store and registers the declared schema.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the store cannot be
    /// opened or the schema fails registration
    pub async fn new(config: ReportingConfig) -> ReportingResult<Self> {
        config.validate()?;
        let store = store::open(&config.store).await?;
        Self::with_store(config, store)
    }

    /// Create a reporting instance over an existing store
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the schema fails
    /// registration
    pub fn with_store(config: ReportingConfig, store: Arc<dyn MetricStore>) -> ReportingResult<Self> {
        config.validate()?;
        let mut registry = Registry::new();
        registry.apply_schema(&config.schema)?;
        Ok(Self::from_parts(config, store, registry))
    }

    /// Create an empty reporting instance over a fresh memory store
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_parts(
            ReportingConfig::default(),
            Arc::new(MemoryStore::new()),
            Registry::new(),
        )
    }

    fn from_parts(config: ReportingConfig, store: Arc<dyn MetricStore>, registry: Registry) -> Self {
        let writer = writer::Writer::new(Arc::clone(&store), config.writer.clone());
        Self {
            inner: Arc::new(ReportingInner {
                config,
                store,
                registry: Arc::new(RwLock::new(registry)),
                writer,
            }),
        }
    }

    /// Register a metric with its evaluators
    ///
    /// # Errors
    ///
    /// Returns a configuration error on a duplicate name, an empty evaluator
    /// list or an unknown evaluator
    pub fn add_metric<S: AsRef<str>>(&self, name: &str, evaluators: &[S]) -> ReportingResult<()> {
        let mut registry = self.inner.registry.write();
        registry.add_metric(name, evaluators)?;
        tracing::info!("Registered metric '{}'", name);

        let order_dependent = registry
            .metric(name)
            .map(|metric| {
                metric
                    .evaluators()
                    .iter()
                    .filter(|evaluator| !evaluator.is_commutative())
                    .count()
            })
            .unwrap_or_default();
        if order_dependent > 0 {
            tracing::debug!(
                "Metric '{}' has {} order dependent evaluators; concurrent saves resolve by commit order",
                name,
                order_dependent
            );
        }
        Ok(())
    }

    /// Register a filter over the given fields
    ///
    /// # Errors
    ///
    /// Returns a configuration error on a duplicate or reserved name or an
    /// empty field list
    pub fn add_filter<S: AsRef<str>>(&self, name: &str, fields: &[S]) -> ReportingResult<()> {
        self.inner.registry.write().add_filter(name, fields)?;
        tracing::info!("Registered filter '{}'", name);
        Ok(())
    }

    /// Retain evaluators of a metric per `granularity`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the metric is unknown or does not
    /// declare an evaluator
    pub fn enable_retainer<S: AsRef<str>>(
        &self,
        granularity: Granularity,
        metric: &str,
        evaluators: &[S],
    ) -> ReportingResult<()> {
        self.inner
            .registry
            .write()
            .enable_retainer(granularity, metric, evaluators)?;
        tracing::info!("Enabled {} retainer for metric '{}'", granularity, metric);
        Ok(())
    }

    /// Save one data point
    ///
    /// # Errors
    ///
    /// See [`Reporting::save_metrics`]
    pub async fn save_metric(&self, point: DataPoint) -> ReportingResult<SaveReport> {
        self.save_metrics(vec![point]).await
    }

    /// Save data points; resolves once every cell update committed
    ///
    /// # Errors
    ///
    /// Returns a validation error before any write for an invalid point and
    /// [`ReportingError::PartialWrite`] if any cell update failed
    pub async fn save_metrics(
        &self,
        points: impl IntoIterator<Item = DataPoint>,
    ) -> ReportingResult<SaveReport> {
        let points: Vec<DataPoint> = points.into_iter().collect();
        self.inner.writer.save(&self.inner.registry, points).await
    }

    /// Save data points, giving up after `duration`
    ///
    /// Updates already issued when the timeout expires may still commit.
    ///
    /// # Errors
    ///
    /// Returns [`ReportingError::Timeout`] on expiry, otherwise as
    /// [`Reporting::save_metrics`]
    pub async fn save_metrics_with_timeout(
        &self,
        points: impl IntoIterator<Item = DataPoint>,
        duration: Duration,
    ) -> ReportingResult<SaveReport> {
        tokio::time::timeout(duration, self.save_metrics(points))
            .await
            .map_err(|_| ReportingError::timeout("save_metrics", duration))?
    }

    /// Query the default filter
    pub fn filter(&self) -> Query {
        Query::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.registry),
            self.inner.config.query.clone(),
        )
    }

    /// Query a filter; `None` values select every instance of it
    pub fn filter_by(&self, name: &str, values: Option<FilterValues>) -> Query {
        self.filter().filter_by(name, values)
    }

    /// Bucket key of the window containing `timestamp` (now when `None`)
    ///
    /// Without a granularity the placeholder `"default"` is returned.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a year outside 0000-9999
    pub fn get_retainer_bucket_key(
        granularity: Option<Granularity>,
        timestamp: Option<DateTime<Utc>>,
    ) -> ReportingResult<String> {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        keys::check_timestamp(timestamp)?;
        Ok(keys::bucket_key(granularity, timestamp))
    }

    /// Every bucket key between `start` and `end`, each mapped to zero
    ///
    /// # Errors
    ///
    /// Returns a validation error for an inverted or oversized range
    pub fn get_empty_buckets(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ReportingResult<BTreeMap<String, f64>> {
        range::empty_buckets(granularity, start, end, self.inner.config.query.max_buckets)
    }

    /// Snapshot of the current registrations
    #[must_use]
    pub fn registry(&self) -> Registry {
        self.inner.registry.read().clone()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ReportingConfig {
        &self.inner.config
    }

    /// Health check of the underlying store
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable
    pub async fn health_check(&self) -> ReportingResult<()> {
        self.inner.store.health_check().await
    }
}

// Implement Clone for Reporting (cheap Arc clone)
impl Clone for Reporting {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
