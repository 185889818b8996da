//! `TallyIO` Reporting Types
//!
//! Data points submitted by clients and the value types returned by queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value of a single data point field
///
/// Metric fields must be numbers; filter dimensions may be either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric value
    Number(f64),
    /// Textual value
    Text(String),
}

impl FieldValue {
    /// Numeric value, if this field is a number
    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    /// Append a canonical, type-tagged encoding of this value
    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Self::Number(value) => {
                out.push(0x01);
                // -0.0 and 0.0 address the same filter instance
                let normalized = if *value == 0.0_f64 { 0.0_f64 } else { *value };
                out.extend_from_slice(&normalized.to_bits().to_le_bytes());
            }
            Self::Text(text) => {
                out.push(0x02);
                write_len_prefixed(out, text);
            }
        }
    }
}

/// Append a length-prefixed string
pub(crate) fn write_len_prefixed(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&(text.len() as u64).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<f32> for FieldValue {
    fn from(value: f32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i64> for FieldValue {
    #[allow(clippy::cast_precision_loss)] // Metric values are reported as f64
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Assignment of values to filter fields
pub type FilterValues = BTreeMap<String, FieldValue>;

/// Build a [`FilterValues`] map from `(field, value)` pairs
#[must_use]
pub fn filter_values<K, V, I>(pairs: I) -> FilterValues
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(field, value)| (field.into(), value.into()))
        .collect()
}

/// One raw observation submitted by a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Field name to value
    pub fields: BTreeMap<String, FieldValue>,

    /// Observation time (save time when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl DataPoint {
    /// Create an empty data point
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Pin the observation time
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Look up a field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Check whether a field is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

impl From<BTreeMap<String, FieldValue>> for DataPoint {
    fn from(fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            fields,
            timestamp: None,
        }
    }
}

/// Value stored in one retainer bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketValue {
    /// Bucket key
    pub bucket: String,
    /// Aggregate value
    pub value: f64,
}

/// Comparison narrowing query results
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Strictly less than
    Lesser(f64),
    /// Strictly greater than
    Greater(f64),
    /// Equal to
    Equal(f64),
    /// Within `[low, high]`
    Between(f64, f64),
}

impl Predicate {
    /// Check whether `value` satisfies the predicate
    #[must_use]
    #[allow(clippy::float_cmp)] // Aggregates are compared exactly, as stored
    pub fn matches(&self, value: f64) -> bool {
        match *self {
            Self::Lesser(bound) => value < bound,
            Self::Greater(bound) => value > bound,
            Self::Equal(expected) => value == expected,
            Self::Between(low, high) => low <= value && value <= high,
        }
    }
}

/// Summary of a completed save call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    /// Data points processed
    pub points: usize,
    /// Cell transactions committed
    pub cell_updates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_point_builder() {
        let point = DataPoint::new().with("value", 50).with("mode", "mobile");
        assert_eq!(point.field("value").and_then(FieldValue::as_number), Some(50.0));
        assert!(point.contains("mode"));
        assert!(!point.contains("region"));
        assert!(point.timestamp.is_none());
    }

    #[test]
    fn test_data_point_from_json() -> Result<(), serde_json::Error> {
        let point: DataPoint = serde_json::from_str(r#"{"fields":{"value":50,"mode":"a"}}"#)?;
        assert_eq!(point.field("value"), Some(&FieldValue::Number(50.0)));
        assert_eq!(point.field("mode"), Some(&FieldValue::Text("a".to_string())));
        Ok(())
    }

    #[test]
    fn test_predicates() {
        assert!(Predicate::Lesser(60.0).matches(57.0));
        assert!(!Predicate::Lesser(57.0).matches(57.0));
        assert!(Predicate::Greater(55.0).matches(57.0));
        assert!(Predicate::Equal(57.0).matches(57.0));
        assert!(Predicate::Between(1.0, 2.0).matches(2.0));
        assert!(Predicate::Between(2.0, 5.0).matches(2.0));
        assert!(!Predicate::Between(10.0, 50.0).matches(55.0));
    }

    #[test]
    fn test_canonical_encoding_distinguishes_types() {
        let mut number = Vec::new();
        FieldValue::Number(1.0).write_canonical(&mut number);
        let mut text = Vec::new();
        FieldValue::Text("1".to_string()).write_canonical(&mut text);
        assert_ne!(number, text);

        let mut negative_zero = Vec::new();
        FieldValue::Number(-0.0).write_canonical(&mut negative_zero);
        let mut zero = Vec::new();
        FieldValue::Number(0.0).write_canonical(&mut zero);
        assert_eq!(negative_zero, zero);
    }
}
