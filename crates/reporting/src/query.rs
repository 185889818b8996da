//! Query Builder
//!
//! A single-use, consuming builder. Selections accumulate without touching
//! the store; the terminal call validates the whole chain against the registry
//! and only then issues reads.
//!
//! ```text
//! filter_by(..) -> sum|diff|count_of|min|max(metric) -> [during(g)] -> [range(a, b)]
//!     -> [lesser|greater|equal|between]* -> value|select|count|values_as_object|values
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    config::QueryConfig,
    error::{ReportingError, ReportingResult},
    evaluator::Evaluator,
    keys::{self, filter_root, metric_leaf, Granularity, DEFAULT_KEY},
    range::{check_range, empty_buckets, fill_gaps, read_buckets, RangeRequest},
    registry::{Registry, DEFAULT_FILTER},
    store::{KeyRange, MetricStore, StorePath},
    types::{BucketValue, FilterValues, Predicate},
};

/// Selection validated against the registry
#[derive(Debug, Clone)]
struct Resolved {
    filter: String,
    filter_key: Option<String>,
    metric: String,
    evaluator: Evaluator,
    granularity: Option<Granularity>,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Resolved {
    fn require_key(&self, terminal: &str) -> ReportingResult<&str> {
        self.filter_key.as_deref().ok_or_else(|| {
            ReportingError::query(format!(
                "{terminal} requires values for filter '{}'",
                self.filter
            ))
        })
    }

    fn range_request(&self, terminal: &str) -> ReportingResult<RangeRequest> {
        let granularity = self.granularity.ok_or_else(|| {
            ReportingError::query(format!("{terminal} requires a retainer, call during() first"))
        })?;
        let (start, end) = self.range.ok_or_else(|| {
            ReportingError::query(format!("{terminal} requires a time range, call range() first"))
        })?;
        Ok(RangeRequest {
            filter: self.filter.clone(),
            filter_key: self.require_key(terminal)?.to_string(),
            granularity,
            start,
            end,
            metric: self.metric.clone(),
            evaluator: self.evaluator,
        })
    }

    fn default_cell(&self, filter_key: &str) -> StorePath {
        keys::cell_path(
            &self.filter,
            filter_key,
            None,
            DEFAULT_KEY,
            &self.metric,
            self.evaluator,
        )
    }
}

/// Fluent query over aggregates of one filter
#[derive(Debug)]
#[must_use = "queries do nothing until a terminal method is called"]
pub struct Query {
    store: Arc<dyn MetricStore>,
    registry: Arc<RwLock<Registry>>,
    config: QueryConfig,
    filter: String,
    values: Option<FilterValues>,
    selection: Option<(Evaluator, String)>,
    granularity: Option<Granularity>,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    predicates: Vec<Predicate>,
    error: Option<ReportingError>,
}

impl Query {
    pub(crate) fn new(
        store: Arc<dyn MetricStore>,
        registry: Arc<RwLock<Registry>>,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            filter: DEFAULT_FILTER.to_string(),
            values: None,
            selection: None,
            granularity: None,
            range: None,
            predicates: Vec::new(),
            error: None,
        }
    }

    /// Select a filter; `None` values address every instance of it
    pub fn filter_by(mut self, name: impl Into<String>, values: Option<FilterValues>) -> Self {
        self.filter = name.into();
        self.values = values;
        self
    }

    /// Select an evaluator of a metric
    pub fn evaluator(mut self, evaluator: Evaluator, metric: impl Into<String>) -> Self {
        self.selection = Some((evaluator, metric.into()));
        self
    }

    /// Select the `sum` aggregate of a metric
    pub fn sum(self, metric: impl Into<String>) -> Self {
        self.evaluator(Evaluator::Sum, metric)
    }

    /// Select the `diff` aggregate of a metric
    pub fn diff(self, metric: impl Into<String>) -> Self {
        self.evaluator(Evaluator::Diff, metric)
    }

    /// Select the `count` aggregate of a metric
    pub fn count_of(self, metric: impl Into<String>) -> Self {
        self.evaluator(Evaluator::Count, metric)
    }

    /// Select the `min` aggregate of a metric
    pub fn min(self, metric: impl Into<String>) -> Self {
        self.evaluator(Evaluator::Min, metric)
    }

    /// Select the `max` aggregate of a metric
    pub fn max(self, metric: impl Into<String>) -> Self {
        self.evaluator(Evaluator::Max, metric)
    }

    /// Read from the retainer at `granularity`
    pub fn during(mut self, granularity: Granularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    /// Restrict retainer reads to `[start, end]`
    pub fn range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if let Err(err) = check_range(start, end) {
            self.fail(err);
        }
        self.range = Some((start, end));
        self
    }

    /// Keep values strictly below `bound`
    pub fn lesser(self, bound: f64) -> Self {
        self.predicate(Predicate::Lesser(bound))
    }

    /// Keep values strictly above `bound`
    pub fn greater(self, bound: f64) -> Self {
        self.predicate(Predicate::Greater(bound))
    }

    /// Keep values equal to `expected`
    pub fn equal(self, expected: f64) -> Self {
        self.predicate(Predicate::Equal(expected))
    }

    /// Keep values within `[low, high]`
    pub fn between(self, low: f64, high: f64) -> Self {
        self.predicate(Predicate::Between(low, high))
    }

    /// Add a predicate; predicates compose by conjunction
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Non-retained aggregate of the selected filter instance
    ///
    /// `None` if the cell was never written or the value fails a predicate.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid chain, a retainer selection or a
    /// missing filter key, and propagates store failures
    pub async fn value(mut self) -> ReportingResult<Option<f64>> {
        let resolved = self.resolve()?;
        if resolved.granularity.is_some() {
            return Err(ReportingError::query(
                "value() reads the non-retained aggregate, use values() for a retainer",
            ));
        }
        let path = resolved.default_cell(resolved.require_key("value()")?);

        let value = self.store.get(&path).await?;
        tracing::debug!("Read {} = {:?}", path, value);
        Ok(value.filter(|value| self.passes(*value)))
    }

    /// Values passing the predicates, oldest first, the last `limit` kept
    ///
    /// With a retainer these are the existing buckets of the range. Without
    /// one they are the non-retained aggregates of the selected instance, or
    /// of every instance in key order when no filter values were given.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid chain and propagates store failures
    pub async fn select(mut self, limit: usize) -> ReportingResult<Vec<f64>> {
        let resolved = self.resolve()?;
        let mut values = self.matching_values(&resolved, "select()").await?;
        let skip = values.len().saturating_sub(limit);
        values.drain(..skip);
        Ok(values)
    }

    /// Number of cells passing the predicates
    ///
    /// Without a retainer this counts distinct filter instances holding the
    /// selected aggregate, not writes. With a retainer it counts existing
    /// buckets of the range.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid chain and propagates store failures
    pub async fn count(mut self) -> ReportingResult<usize> {
        let resolved = self.resolve()?;
        Ok(self.matching_values(&resolved, "count()").await?.len())
    }

    /// Bucket key to value over the range
    ///
    /// Predicates apply to stored buckets; with `fill_gaps` every other
    /// bucket of the range, and every filtered out one, reads as zero.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid chain or an oversized range and
    /// propagates store failures
    pub async fn values_as_object(mut self, fill: bool) -> ReportingResult<BTreeMap<String, f64>> {
        let resolved = self.resolve()?;
        let request = resolved.range_request("values_as_object()")?;
        let empty = if fill {
            Some(empty_buckets(
                request.granularity,
                request.start,
                request.end,
                self.config.max_buckets,
            )?)
        } else {
            None
        };

        let actual = self.read_filtered(&request).await?;
        Ok(match empty {
            Some(empty) => fill_gaps(empty, &actual),
            None => actual.into_iter().map(|b| (b.bucket, b.value)).collect(),
        })
    }

    /// Existing buckets of the range passing the predicates, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid chain and propagates store failures
    pub async fn values(mut self) -> ReportingResult<Vec<BucketValue>> {
        let resolved = self.resolve()?;
        let request = resolved.range_request("values()")?;
        self.read_filtered(&request).await
    }

    fn fail(&mut self, err: ReportingError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn passes(&self, value: f64) -> bool {
        self.predicates.iter().all(|p| p.matches(value))
    }

    /// Validate the chain; no store access happens before this succeeds
    fn resolve(&mut self) -> ReportingResult<Resolved> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let registry = self.registry.read();
        let filter = registry
            .filter(&self.filter)
            .ok_or_else(|| ReportingError::configuration(format!("Unknown filter '{}'", self.filter)))?;

        let filter_key = match self.values {
            Some(ref values) => Some(keys::filter_key(filter, values)?),
            None if filter.is_default() => Some(DEFAULT_KEY.to_string()),
            None => None,
        };

        let (evaluator, metric_name) = self
            .selection
            .clone()
            .ok_or_else(|| ReportingError::query("No metric selected"))?;
        let metric = registry.metric(&metric_name).ok_or_else(|| {
            ReportingError::configuration(format!("Unknown metric '{metric_name}'"))
        })?;
        if !metric.declares(evaluator) {
            return Err(ReportingError::configuration(format!(
                "Metric '{metric_name}' does not declare evaluator '{evaluator}'"
            )));
        }

        if let Some(granularity) = self.granularity {
            if !registry.retains(&metric_name, granularity, evaluator) {
                return Err(ReportingError::configuration(format!(
                    "Evaluator '{evaluator}' of metric '{metric_name}' is not retained per {granularity}"
                )));
            }
        } else if self.range.is_some() {
            return Err(ReportingError::query(
                "range() requires a retainer, call during() first",
            ));
        }

        Ok(Resolved {
            filter: self.filter.clone(),
            filter_key,
            metric: metric_name,
            evaluator,
            granularity: self.granularity,
            range: self.range,
        })
    }

    async fn read_filtered(&self, request: &RangeRequest) -> ReportingResult<Vec<BucketValue>> {
        let mut values = read_buckets(self.store.as_ref(), request).await?;
        values.retain(|bucket| self.passes(bucket.value));
        Ok(values)
    }

    async fn matching_values(&self, resolved: &Resolved, terminal: &str) -> ReportingResult<Vec<f64>> {
        if resolved.granularity.is_some() {
            let request = resolved.range_request(terminal)?;
            let values = self.read_filtered(&request).await?;
            return Ok(values.into_iter().map(|bucket| bucket.value).collect());
        }

        if let Some(ref filter_key) = resolved.filter_key {
            let value = self.store.get(&resolved.default_cell(filter_key)).await?;
            return Ok(value.filter(|value| self.passes(*value)).into_iter().collect());
        }

        // every instance of the filter, reading only its non-retained cell
        let leaf: StorePath = [DEFAULT_KEY.to_string(), metric_leaf(&resolved.metric, resolved.evaluator)]
            .into_iter()
            .collect();
        let snapshots = self
            .store
            .range(
                &filter_root(&resolved.filter),
                &KeyRange::all().only_leaf(leaf.clone()),
            )
            .await?;
        tracing::debug!(
            "Scanned {} instances of filter '{}'",
            snapshots.len(),
            resolved.filter
        );

        Ok(snapshots
            .iter()
            .filter_map(|snapshot| snapshot.child(&leaf))
            .filter(|value| self.passes(*value))
            .collect())
    }
}
