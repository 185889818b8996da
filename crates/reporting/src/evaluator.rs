//! Evaluator Set
//!
//! Aggregation functions folding an incoming raw value into the value stored in
//! one aggregate cell. Every evaluator is a pure function of
//! `(current, incoming)` and accepts an absent current value (first write).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReportingError;

/// Aggregation applied to a metric cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Evaluator {
    /// Running total of raw values
    Sum,
    /// Most recently committed raw value
    Diff,
    /// Number of raw values observed
    Count,
    /// Smallest raw value observed
    Min,
    /// Largest raw value observed
    Max,
}

impl Evaluator {
    /// All supported evaluators
    pub const ALL: [Self; 5] = [Self::Sum, Self::Diff, Self::Count, Self::Min, Self::Max];

    /// Fold `incoming` into the stored value
    #[must_use]
    pub fn combine(self, current: Option<f64>, incoming: f64) -> f64 {
        match self {
            Self::Sum => current.unwrap_or(0.0_f64) + incoming,
            Self::Diff => incoming,
            Self::Count => current.unwrap_or(0.0_f64) + 1.0_f64,
            Self::Min => current.map_or(incoming, |value| value.min(incoming)),
            Self::Max => current.map_or(incoming, |value| value.max(incoming)),
        }
    }

    /// Lowercase evaluator name used in cell paths
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Diff => "diff",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Whether repeated application is order independent
    #[must_use]
    pub const fn is_commutative(self) -> bool {
        !matches!(self, Self::Diff)
    }
}

impl fmt::Display for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Evaluator {
    type Err = ReportingError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|evaluator| evaluator.as_str() == name)
            .ok_or_else(|| ReportingError::configuration(format!("Unknown evaluator '{name}'")))
    }
}

/// Parse a list of evaluator names, rejecting empty lists and unknown names
///
/// Duplicates are dropped while keeping declaration order.
///
/// # Errors
///
/// Returns a configuration error for an empty list or an unknown name
pub fn parse_evaluators<S: AsRef<str>>(names: &[S]) -> Result<Vec<Evaluator>, ReportingError> {
    if names.is_empty() {
        return Err(ReportingError::configuration(
            "At least one evaluator is required",
        ));
    }

    let mut evaluators = Vec::with_capacity(names.len());
    for name in names {
        let evaluator = name.as_ref().parse::<Evaluator>()?;
        if !evaluators.contains(&evaluator) {
            evaluators.push(evaluator);
        }
    }
    Ok(evaluators)
}
