//! Writer
//!
//! Turns each data point into the full set of cell updates (every applicable
//! filter, every evaluator, every active retainer) and applies them as atomic
//! store transactions with bounded concurrency.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    config::WriterConfig,
    error::{ReportingError, ReportingResult},
    evaluator::Evaluator,
    keys::{bucket_key, cell_path, check_timestamp, filter_key, DEFAULT_KEY},
    registry::Registry,
    store::{MetricStore, StorePath, UpdateFn},
    telemetry,
    types::{DataPoint, FieldValue, SaveReport},
};

/// One pending cell transaction
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    /// Target cell
    pub path: StorePath,
    /// Evaluator folding the raw value into the cell
    pub evaluator: Evaluator,
    /// Raw metric value
    pub raw: f64,
}

/// Compute every cell update produced by one data point
///
/// `now` stands in for a missing point timestamp.
///
/// # Errors
///
/// Returns a validation error for a non-numeric metric value, a timestamp
/// outside the supported years, or a filter key that cannot be built
pub fn plan_updates(
    registry: &Registry,
    point: &DataPoint,
    now: DateTime<Utc>,
) -> ReportingResult<Vec<CellUpdate>> {
    let mut reported = Vec::new();
    for metric in registry.metrics() {
        match point.field(metric.name()) {
            Some(FieldValue::Number(raw)) if raw.is_finite() => reported.push((metric, *raw)),
            Some(other) => {
                return Err(ReportingError::validation(
                    metric.name(),
                    format!("metric value must be a finite number, got '{other}'"),
                ));
            }
            None => {}
        }
    }
    if reported.is_empty() {
        return Ok(Vec::new());
    }

    let timestamp = point.timestamp.unwrap_or(now);
    check_timestamp(timestamp)?;

    let mut instances = Vec::new();
    for filter in registry.filters().filter(|f| f.applies_to(point)) {
        instances.push((filter.name(), filter_key(filter, &point.fields)?));
    }

    let mut updates = Vec::new();
    for (metric, raw) in reported {
        for (filter, key) in &instances {
            for evaluator in metric.evaluators() {
                updates.push(CellUpdate {
                    path: cell_path(filter, key, None, DEFAULT_KEY, metric.name(), *evaluator),
                    evaluator: *evaluator,
                    raw,
                });
            }

            for retainer in registry.retainers_for(metric.name()) {
                let granularity = retainer.granularity();
                let bucket = bucket_key(Some(granularity), timestamp);
                for evaluator in retainer.evaluators() {
                    updates.push(CellUpdate {
                        path: cell_path(
                            filter,
                            key,
                            Some(granularity),
                            &bucket,
                            metric.name(),
                            *evaluator,
                        ),
                        evaluator: *evaluator,
                        raw,
                    });
                }
            }
        }
    }
    Ok(updates)
}

/// Applies data points to the store
#[derive(Debug, Clone)]
pub struct Writer {
    store: Arc<dyn MetricStore>,
    config: WriterConfig,
}

impl Writer {
    /// Create a writer
    #[must_use]
    pub fn new(store: Arc<dyn MetricStore>, config: WriterConfig) -> Self {
        Self { store, config }
    }

    /// Save data points
    ///
    /// Every point is planned before any write is issued. Updates of
    /// different cells run concurrently; updates of the same cell are applied
    /// in point order, so `diff` keeps the value of the last point.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any write if a point is invalid, and
    /// [`ReportingError::PartialWrite`] if any cell transaction failed.
    /// Committed cells are not rolled back.
    pub async fn save(
        &self,
        registry: &RwLock<Registry>,
        points: Vec<DataPoint>,
    ) -> ReportingResult<SaveReport> {
        let start = Instant::now();
        let now = Utc::now();

        let plans = {
            let registry = registry.read();
            points
                .iter()
                .map(|point| plan_updates(&registry, point, now))
                .collect::<ReportingResult<Vec<_>>>()
                .map_err(|err| {
                    if err.is_configuration() {
                        tracing::debug!("Rejected save of {} data points: {}", points.len(), err);
                    } else {
                        tracing::warn!("Failed to plan save of {} data points: {}", points.len(), err);
                    }
                    err
                })?
        };

        let mut cells: BTreeMap<StorePath, Vec<CellUpdate>> = BTreeMap::new();
        let mut total = 0_usize;
        for update in plans.into_iter().flatten() {
            total += 1;
            cells.entry(update.path.clone()).or_default().push(update);
        }

        if total == 0 {
            tracing::debug!("No registered metric in {} data points", points.len());
            return Ok(SaveReport {
                points: points.len(),
                cell_updates: 0,
            });
        }

        tracing::debug!(
            "Saving {} data points: {} updates across {} cells",
            points.len(),
            total,
            cells.len()
        );

        let outcomes: Vec<Vec<ReportingResult<f64>>> = stream::iter(cells.into_values())
            .map(|updates| self.apply_in_order(updates))
            .buffer_unordered(self.config.max_in_flight_updates.max(1))
            .collect()
            .await;

        let mut failed = 0_usize;
        let mut first = None;
        for outcome in outcomes.into_iter().flatten() {
            if let Err(err) = outcome {
                failed += 1;
                if first.is_none() {
                    first = Some(err);
                }
            }
        }

        let duration = start.elapsed();
        telemetry::record_save_duration(duration);
        if duration.as_millis() >= u128::from(self.config.slow_save_warn_ms) {
            tracing::warn!("Save of {} data points took {:?}", points.len(), duration);
        }

        match first {
            Some(first) => {
                tracing::warn!("{} of {} cell updates failed: {}", failed, total, first);
                Err(ReportingError::PartialWrite {
                    failed,
                    total,
                    first: Box::new(first),
                })
            }
            None => Ok(SaveReport {
                points: points.len(),
                cell_updates: total,
            }),
        }
    }

    /// Apply the updates of one cell sequentially
    async fn apply_in_order(&self, updates: Vec<CellUpdate>) -> Vec<ReportingResult<f64>> {
        let mut outcomes = Vec::with_capacity(updates.len());
        for update in updates {
            outcomes.push(self.apply(update).await);
        }
        outcomes
    }

    async fn apply(&self, update: CellUpdate) -> ReportingResult<f64> {
        let CellUpdate {
            path,
            evaluator,
            raw,
        } = update;
        let combine: UpdateFn = Arc::new(move |current: Option<f64>| evaluator.combine(current, raw));

        let result = self.store.transaction(&path, combine).await;
        telemetry::record_cell_update(evaluator, result.is_ok());
        match &result {
            Ok(value) => tracing::trace!("Updated {} = {}", path, value),
            Err(err) => tracing::warn!("Cell update on {} failed: {}", path, err),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Granularity;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn registry() -> ReportingResult<Registry> {
        let mut registry = Registry::new();
        registry.add_metric("value", &["sum", "diff"])?;
        registry.add_filter("custom", &["mode"])?;
        registry.enable_retainer(Granularity::Second, "value", &["sum"])?;
        Ok(registry)
    }

    fn paths(updates: &[CellUpdate]) -> Vec<String> {
        updates.iter().map(|u| u.path.to_string()).collect()
    }

    #[test]
    fn test_plan_default_filter_only() -> ReportingResult<()> {
        let registry = registry()?;
        let ts = Utc
            .with_ymd_and_hms(2026, 10, 16, 9, 59, 7)
            .single()
            .unwrap_or_default();
        let updates = plan_updates(&registry, &DataPoint::new().with("value", 50).at(ts), ts)?;

        assert_eq!(
            paths(&updates),
            vec![
                "default/default/default/value~sum",
                "default/default/default/value~diff",
                "default/default/retainers/second/2026-10-16T09:59:07/value~sum",
            ]
        );
        assert!(updates.iter().all(|u| u.raw == 50.0));
        Ok(())
    }

    #[test]
    fn test_plan_fans_out_to_custom_filter() -> ReportingResult<()> {
        let registry = registry()?;
        let point = DataPoint::new().with("value", 5).with("mode", "a");
        let updates = plan_updates(&registry, &point, Utc::now())?;

        assert_eq!(updates.len(), 6);
        assert_eq!(
            updates
                .iter()
                .filter(|u| u.path.segments()[0] == "custom")
                .count(),
            3
        );
        Ok(())
    }

    #[test]
    fn test_plan_rejects_invalid_points() -> ReportingResult<()> {
        let registry = registry()?;
        let text = DataPoint::new().with("value", "fifty");
        assert!(matches!(
            plan_updates(&registry, &text, Utc::now()),
            Err(ReportingError::Validation { .. })
        ));

        let nan = DataPoint::new().with("value", f64::NAN);
        assert!(plan_updates(&registry, &nan, Utc::now()).is_err());

        let unrelated = DataPoint::new().with("latency", 3);
        assert!(plan_updates(&registry, &unrelated, Utc::now())?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_applies_same_cell_in_order() -> ReportingResult<()> {
        let registry = RwLock::new(registry()?);
        let store = Arc::new(MemoryStore::new());
        let writer = Writer::new(store.clone(), WriterConfig::default());

        let points = [50.0, 1.0, 23.0]
            .into_iter()
            .map(|raw| DataPoint::new().with("value", raw))
            .collect();
        let report = writer.save(&registry, points).await?;
        assert_eq!(report.points, 3);
        assert_eq!(report.cell_updates, 9);

        let diff = cell_path("default", DEFAULT_KEY, None, DEFAULT_KEY, "value", Evaluator::Diff);
        let sum = cell_path("default", DEFAULT_KEY, None, DEFAULT_KEY, "value", Evaluator::Sum);
        assert_eq!(store.get(&diff).await?, Some(23.0));
        assert_eq!(store.get(&sum).await?, Some(74.0));
        Ok(())
    }
}
