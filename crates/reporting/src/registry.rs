//! Registry
//!
//! Declared metrics, filters and enabled retainers. Registration validates
//! every name up front so the writer and query resolver can trust the registry.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::{
    config::SchemaConfig,
    error::{ReportingError, ReportingResult},
    evaluator::{parse_evaluators, Evaluator},
    keys::{Granularity, LEAF_SEPARATOR},
    types::DataPoint,
};

/// Name of the dimensionless filter
pub const DEFAULT_FILTER: &str = "default";

/// Declared metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    name: String,
    evaluators: Vec<Evaluator>,
}

impl Metric {
    /// Metric name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared evaluators in declaration order
    #[must_use]
    pub fn evaluators(&self) -> &[Evaluator] {
        &self.evaluators
    }

    /// Check whether the metric declares `evaluator`
    #[must_use]
    pub fn declares(&self, evaluator: Evaluator) -> bool {
        self.evaluators.contains(&evaluator)
    }
}

/// Declared filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    name: String,
    fields: Vec<String>,
}

impl Filter {
    pub(crate) fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// The dimensionless filter every data point belongs to
    #[must_use]
    pub fn default_filter() -> Self {
        Self::new(DEFAULT_FILTER, Vec::new())
    }

    /// Filter name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field names composing the filter key
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Check whether this is the default filter
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_FILTER
    }

    /// A data point is aggregated under a filter when it carries every declared field
    #[must_use]
    pub fn applies_to(&self, point: &DataPoint) -> bool {
        self.fields.iter().all(|field| point.contains(field))
    }
}

/// Bucketed retention of a metric at one granularity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Retainer {
    granularity: Granularity,
    evaluators: Vec<Evaluator>,
}

impl Retainer {
    /// Retention granularity
    #[must_use]
    pub const fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Retained evaluators
    #[must_use]
    pub fn evaluators(&self) -> &[Evaluator] {
        &self.evaluators
    }
}

/// Metric, filter and retainer declarations
#[derive(Debug, Clone)]
pub struct Registry {
    metrics: BTreeMap<String, Metric>,
    filters: BTreeMap<String, Filter>,
    retainers: BTreeMap<String, Vec<Retainer>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry holding only the default filter
    #[must_use]
    pub fn new() -> Self {
        let mut filters = BTreeMap::new();
        filters.insert(DEFAULT_FILTER.to_string(), Filter::default_filter());
        Self {
            metrics: BTreeMap::new(),
            filters,
            retainers: BTreeMap::new(),
        }
    }

    /// Register a metric
    ///
    /// # Errors
    ///
    /// Fails on an invalid or duplicate name, an empty evaluator list or an
    /// unknown evaluator
    pub fn add_metric<S: AsRef<str>>(&mut self, name: &str, evaluators: &[S]) -> ReportingResult<()> {
        validate_name("metric", name)?;
        if self.metrics.contains_key(name) {
            return Err(ReportingError::configuration(format!(
                "Metric '{name}' is already registered"
            )));
        }

        let evaluators = parse_evaluators(evaluators)?;
        self.metrics.insert(
            name.to_string(),
            Metric {
                name: name.to_string(),
                evaluators,
            },
        );
        Ok(())
    }

    /// Register a filter
    ///
    /// # Errors
    ///
    /// Fails on an invalid, reserved or duplicate name and on an empty or
    /// invalid field list
    pub fn add_filter<S: AsRef<str>>(&mut self, name: &str, fields: &[S]) -> ReportingResult<()> {
        validate_name("filter", name)?;
        if name == DEFAULT_FILTER {
            return Err(ReportingError::configuration(format!(
                "Filter name '{DEFAULT_FILTER}' is reserved"
            )));
        }
        if self.filters.contains_key(name) {
            return Err(ReportingError::configuration(format!(
                "Filter '{name}' is already registered"
            )));
        }
        if fields.is_empty() {
            return Err(ReportingError::configuration(format!(
                "Filter '{name}' must declare at least one field"
            )));
        }

        let mut declared: Vec<String> = Vec::with_capacity(fields.len());
        for field in fields {
            let field = field.as_ref();
            validate_name("field", field)?;
            if declared.iter().any(|existing| existing == field) {
                return Err(ReportingError::configuration(format!(
                    "Filter '{name}' declares field '{field}' twice"
                )));
            }
            declared.push(field.to_string());
        }

        self.filters
            .insert(name.to_string(), Filter::new(name, declared));
        Ok(())
    }

    /// Enable bucketed retention of a metric
    ///
    /// Enabling the same granularity twice merges the evaluator lists.
    ///
    /// # Errors
    ///
    /// Fails if the metric is unknown or an evaluator is not declared by it
    pub fn enable_retainer<S: AsRef<str>>(
        &mut self,
        granularity: Granularity,
        metric: &str,
        evaluators: &[S],
    ) -> ReportingResult<()> {
        let declared = self.metrics.get(metric).ok_or_else(|| {
            ReportingError::configuration(format!("Unknown metric '{metric}'"))
        })?;

        let evaluators = parse_evaluators(evaluators)?;
        if let Some(evaluator) = evaluators.iter().find(|e| !declared.declares(**e)) {
            return Err(ReportingError::configuration(format!(
                "Metric '{metric}' does not declare evaluator '{evaluator}'"
            )));
        }

        let retainers = self.retainers.entry(metric.to_string()).or_default();
        match retainers.iter_mut().find(|r| r.granularity == granularity) {
            Some(retainer) => {
                for evaluator in evaluators {
                    if !retainer.evaluators.contains(&evaluator) {
                        retainer.evaluators.push(evaluator);
                    }
                }
            }
            None => {
                retainers.push(Retainer {
                    granularity,
                    evaluators,
                });
                retainers.sort_by_key(Retainer::granularity);
            }
        }
        Ok(())
    }

    /// Register every declaration of a schema: metrics, then filters, then retainers
    ///
    /// # Errors
    ///
    /// Returns the first registration error
    pub fn apply_schema(&mut self, schema: &SchemaConfig) -> ReportingResult<()> {
        for metric in &schema.metrics {
            self.add_metric(&metric.name, &metric.evaluators)?;
        }
        for filter in &schema.filters {
            self.add_filter(&filter.name, &filter.fields)?;
        }
        for retainer in &schema.retainers {
            let granularity = retainer.granularity.parse::<Granularity>()?;
            self.enable_retainer(granularity, &retainer.metric, &retainer.evaluators)?;
        }

        tracing::info!(
            "Applied schema: {} metrics, {} filters, {} retainers",
            schema.metrics.len(),
            schema.filters.len(),
            schema.retainers.len()
        );
        Ok(())
    }

    /// Look up a metric
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    /// Look up a filter; `"default"` always resolves
    #[must_use]
    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.get(name)
    }

    /// Registered metrics in name order
    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.values()
    }

    /// Registered filters in name order, including the default filter
    pub fn filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters.values()
    }

    /// Active retainers of a metric, finest granularity first
    #[must_use]
    pub fn retainers_for(&self, metric: &str) -> &[Retainer] {
        self.retainers.get(metric).map_or(&[], Vec::as_slice)
    }

    /// Check whether `evaluator` of `metric` is retained at `granularity`
    #[must_use]
    pub fn retains(&self, metric: &str, granularity: Granularity, evaluator: Evaluator) -> bool {
        self.retainers_for(metric)
            .iter()
            .any(|r| r.granularity == granularity && r.evaluators.contains(&evaluator))
    }
}

/// Names must stay single path segments
fn validate_name(kind: &str, name: &str) -> ReportingResult<()> {
    if name.is_empty() {
        return Err(ReportingError::validation(kind, "name must not be empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| *c == '/' || *c == LEAF_SEPARATOR || c.is_control())
    {
        return Err(ReportingError::validation(
            kind,
            format!("name '{}' contains forbidden character {c:?}", name.escape_debug()),
        ));
    }
    Ok(())
}
