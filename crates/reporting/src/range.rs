//! Range Resolver
//!
//! Bucket boundaries for a time range, the ordered retainer read, and zero
//! gap filling.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::{
    error::{ReportingError, ReportingResult},
    evaluator::Evaluator,
    keys::{bucket_key, bucket_start, check_timestamp, metric_leaf, retainer_path, Granularity},
    store::{KeyRange, MetricStore, StorePath},
    telemetry,
    types::BucketValue,
};

/// One retainer read over an inclusive time range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    /// Filter name
    pub filter: String,
    /// Filter key
    pub filter_key: String,
    /// Retainer granularity
    pub granularity: Granularity,
    /// Range start (inclusive)
    pub start: DateTime<Utc>,
    /// Range end (inclusive)
    pub end: DateTime<Utc>,
    /// Metric name
    pub metric: String,
    /// Evaluator
    pub evaluator: Evaluator,
}

impl RangeRequest {
    /// Child key bounds `[bucket(start), bucket(end)]`
    #[must_use]
    pub fn bucket_range(&self) -> KeyRange {
        KeyRange::between(
            bucket_key(Some(self.granularity), self.start),
            bucket_key(Some(self.granularity), self.end),
        )
    }
}

/// Check that a range is ordered and addressable
///
/// # Errors
///
/// Returns a validation error for `start > end` or unsupported years
pub fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> ReportingResult<()> {
    check_timestamp(start)?;
    check_timestamp(end)?;
    if start > end {
        return Err(ReportingError::validation(
            "range",
            format!("start {start} is after end {end}"),
        ));
    }
    Ok(())
}

/// Read the existing buckets of a retainer, in chronological order
///
/// Buckets without a value for the requested metric and evaluator are skipped.
///
/// # Errors
///
/// Propagates store failures
pub async fn read_buckets(
    store: &dyn MetricStore,
    request: &RangeRequest,
) -> ReportingResult<Vec<BucketValue>> {
    let parent = retainer_path(&request.filter, &request.filter_key, request.granularity);
    let leaf = StorePath::root().child(metric_leaf(&request.metric, request.evaluator));

    let snapshots = store.range(&parent, &request.bucket_range()).await?;
    telemetry::record_range_read(request.granularity);

    let values: Vec<BucketValue> = snapshots
        .iter()
        .filter_map(|snapshot| {
            snapshot.child(&leaf).map(|value| BucketValue {
                bucket: snapshot.key().to_string(),
                value,
            })
        })
        .collect();

    tracing::debug!(
        "Read {} of {} buckets under {} for {}",
        values.len(),
        snapshots.len(),
        parent,
        leaf
    );
    Ok(values)
}

/// Every bucket key of the range, each mapped to zero
///
/// # Errors
///
/// Returns a validation error for an invalid range or one spanning more than
/// `max_buckets` windows
pub fn empty_buckets(
    granularity: Granularity,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_buckets: usize,
) -> ReportingResult<BTreeMap<String, f64>> {
    check_range(start, end)?;

    let first = bucket_start(granularity, start);
    let last = bucket_start(granularity, end);
    let span = (last - first).num_seconds() / granularity.duration_secs();
    let count = usize::try_from(span).map_or(usize::MAX, |span| span.saturating_add(1));
    if count > max_buckets {
        return Err(ReportingError::validation(
            "range",
            format!("{count} {granularity} buckets exceed the limit of {max_buckets}"),
        ));
    }

    let step = granularity.duration();
    let mut buckets = BTreeMap::new();
    let mut current = first;
    while current <= last {
        buckets.insert(bucket_key(Some(granularity), current), 0.0);
        current += step;
    }
    Ok(buckets)
}

/// Overlay actual bucket values on a zero-filled range
#[must_use]
pub fn fill_gaps(mut empty: BTreeMap<String, f64>, actual: &[BucketValue]) -> BTreeMap<String, f64> {
    for bucket in actual {
        empty.insert(bucket.bucket.clone(), bucket.value);
    }
    empty
}
