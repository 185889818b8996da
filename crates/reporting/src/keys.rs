//! Key Builder
//!
//! Deterministic construction of filter keys, bucket keys and cell paths.
//!
//! ```text
//! {filter}/{filter_key}/default/{metric}~{evaluator}
//! {filter}/{filter_key}/retainers/{granularity}/{bucket}/{metric}~{evaluator}
//! ```

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{
    error::{ReportingError, ReportingResult},
    evaluator::Evaluator,
    registry::Filter,
    store::StorePath,
    types::{write_len_prefixed, FilterValues},
};

/// Filter key of the default filter and bucket placeholder of non-retained cells
pub const DEFAULT_KEY: &str = "default";

/// Path segment under which retained cells live
pub const RETAINERS_SEGMENT: &str = "retainers";

/// Separator between metric and evaluator in a leaf name
pub const LEAF_SEPARATOR: char = '~';

/// Supported year range (four digit bucket keys)
const MIN_YEAR: i32 = 0;
const MAX_YEAR: i32 = 9999;

/// Time granularity of a retainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One second windows
    Second,
    /// One minute windows
    Minute,
    /// One hour windows
    Hour,
    /// One day windows
    Day,
}

impl Granularity {
    /// All granularities, finest first
    pub const ALL: [Self; 4] = [Self::Second, Self::Minute, Self::Hour, Self::Day];

    /// Window length in seconds
    #[must_use]
    pub const fn duration_secs(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Window length
    #[must_use]
    pub fn duration(self) -> Duration {
        Duration::seconds(self.duration_secs())
    }

    /// Lowercase name used in store paths
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    const fn bucket_format(self) -> &'static str {
        match self {
            Self::Second => "%Y-%m-%dT%H:%M:%S",
            Self::Minute => "%Y-%m-%dT%H:%M",
            Self::Hour => "%Y-%m-%dT%H",
            Self::Day => "%Y-%m-%d",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ReportingError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|granularity| granularity.as_str() == name)
            .ok_or_else(|| {
                ReportingError::configuration(format!("Unsupported granularity '{name}'"))
            })
    }
}

/// Reject timestamps whose year does not fit a four digit bucket key
///
/// # Errors
///
/// Returns a validation error outside years 0000-9999
pub fn check_timestamp(timestamp: DateTime<Utc>) -> ReportingResult<()> {
    let year = timestamp.year();
    if (MIN_YEAR..=MAX_YEAR).contains(&year) {
        Ok(())
    } else {
        Err(ReportingError::validation(
            "timestamp",
            format!("year {year} is outside {MIN_YEAR:04}-{MAX_YEAR}"),
        ))
    }
}

/// Start of the window containing `timestamp`
#[must_use]
pub fn bucket_start(granularity: Granularity, timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let secs = timestamp.timestamp();
    let offset = secs.rem_euclid(granularity.duration_secs());
    timestamp
        - Duration::seconds(offset)
        - Duration::nanoseconds(i64::from(timestamp.timestamp_subsec_nanos()))
}

/// Sortable key of the window containing `timestamp`
///
/// Without a granularity the constant placeholder `"default"` is returned.
#[must_use]
pub fn bucket_key(granularity: Option<Granularity>, timestamp: DateTime<Utc>) -> String {
    match granularity {
        Some(granularity) => bucket_start(granularity, timestamp)
            .format(granularity.bucket_format())
            .to_string(),
        None => DEFAULT_KEY.to_string(),
    }
}

/// Deterministic key of one filter instance
///
/// The default filter always yields `"default"`. Custom filters hash a
/// length-prefixed encoding of the filter name and each declared field with
/// its value, in declaration order.
///
/// # Errors
///
/// Returns a validation error if a declared field has no value
pub fn filter_key(filter: &Filter, values: &FilterValues) -> ReportingResult<String> {
    if filter.is_default() {
        return Ok(DEFAULT_KEY.to_string());
    }

    let mut canonical = Vec::with_capacity(64);
    write_len_prefixed(&mut canonical, filter.name());
    for field in filter.fields() {
        let value = values.get(field).ok_or_else(|| {
            ReportingError::validation(
                field.as_str(),
                format!("missing value for filter '{}'", filter.name()),
            )
        })?;
        write_len_prefixed(&mut canonical, field);
        value.write_canonical(&mut canonical);
    }

    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Leaf name `{metric}~{evaluator}`
#[must_use]
pub fn metric_leaf(metric: &str, evaluator: Evaluator) -> String {
    format!("{metric}{LEAF_SEPARATOR}{evaluator}")
}

/// Node holding every instance of a filter
#[must_use]
pub fn filter_root(filter: &str) -> StorePath {
    StorePath::root().child(filter)
}

/// Node holding the buckets of one retainer of a filter instance
#[must_use]
pub fn retainer_path(filter: &str, filter_key: &str, granularity: Granularity) -> StorePath {
    filter_root(filter)
        .child(filter_key)
        .child(RETAINERS_SEGMENT)
        .child(granularity.as_str())
}

/// Path of one aggregate cell
#[must_use]
pub fn cell_path(
    filter: &str,
    filter_key: &str,
    granularity: Option<Granularity>,
    bucket: &str,
    metric: &str,
    evaluator: Evaluator,
) -> StorePath {
    let parent = match granularity {
        Some(granularity) => retainer_path(filter, filter_key, granularity),
        None => filter_root(filter).child(filter_key),
    };
    parent.child(bucket).child(metric_leaf(metric, evaluator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::filter_values;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .unwrap_or_default()
    }

    #[test]
    fn test_bucket_keys() {
        let ts = at(2026, 10, 16, 9, 59, 7) + Duration::milliseconds(420);
        assert_eq!(bucket_key(Some(Granularity::Second), ts), "2026-10-16T09:59:07");
        assert_eq!(bucket_key(Some(Granularity::Minute), ts), "2026-10-16T09:59");
        assert_eq!(bucket_key(Some(Granularity::Hour), ts), "2026-10-16T09");
        assert_eq!(bucket_key(Some(Granularity::Day), ts), "2026-10-16");
        assert_eq!(bucket_key(None, ts), DEFAULT_KEY);
    }

    #[test]
    fn test_bucket_start_before_epoch() {
        let ts = at(1969, 12, 31, 23, 59, 30);
        assert_eq!(bucket_start(Granularity::Minute, ts), at(1969, 12, 31, 23, 59, 0));
        assert_eq!(bucket_key(Some(Granularity::Day), ts), "1969-12-31");
    }

    #[test]
    fn test_year_bounds() {
        assert!(check_timestamp(at(2026, 1, 1, 0, 0, 0)).is_ok());
        assert!(check_timestamp(at(10_000, 1, 1, 0, 0, 0)).is_err());
        assert!(check_timestamp(at(-1, 1, 1, 0, 0, 0)).is_err());
    }

    #[test]
    fn test_granularity_names() {
        assert_eq!("minute".parse::<Granularity>().ok(), Some(Granularity::Minute));
        assert!(matches!(
            "week".parse::<Granularity>(),
            Err(ReportingError::Configuration { .. })
        ));
        assert!(Granularity::Second < Granularity::Day);
    }

    #[test]
    fn test_cell_paths() {
        let plain = cell_path("default", DEFAULT_KEY, None, DEFAULT_KEY, "value", Evaluator::Sum);
        assert_eq!(plain.to_string(), "default/default/default/value~sum");

        let retained = cell_path(
            "custom",
            "abc",
            Some(Granularity::Minute),
            "2026-10-16T09:59",
            "value",
            Evaluator::Diff,
        );
        assert_eq!(
            retained.to_string(),
            "custom/abc/retainers/minute/2026-10-16T09:59/value~diff"
        );
    }

    #[test]
    fn test_filter_key_is_deterministic() -> ReportingResult<()> {
        let filter = Filter::new("custom", vec!["mode".to_string(), "region".to_string()]);
        let a = filter_key(&filter, &filter_values([("mode", "mobile"), ("region", "eu")]))?;
        let b = filter_key(&filter, &filter_values([("region", "eu"), ("mode", "mobile")]))?;
        let c = filter_key(&filter, &filter_values([("mode", "desktop"), ("region", "eu")]))?;

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        Ok(())
    }

    #[test]
    fn test_filter_key_distinguishes_types_and_names() -> ReportingResult<()> {
        let filter = Filter::new("custom", vec!["mode".to_string()]);
        let number = filter_key(&filter, &filter_values([("mode", 1)]))?;
        let text = filter_key(&filter, &filter_values([("mode", "1")]))?;
        assert_ne!(number, text);

        let other = Filter::new("other", vec!["mode".to_string()]);
        assert_ne!(filter_key(&other, &filter_values([("mode", 1)]))?, number);
        Ok(())
    }

    #[test]
    fn test_filter_key_requires_declared_fields() {
        let filter = Filter::new("custom", vec!["mode".to_string()]);
        let result = filter_key(&filter, &filter_values([("region", "eu")]));
        assert!(matches!(result, Err(ReportingError::Validation { .. })));

        let default = Filter::default_filter();
        assert_eq!(
            filter_key(&default, &FilterValues::new()).ok().as_deref(),
            Some(DEFAULT_KEY)
        );
    }

    proptest! {
        #[test]
        fn prop_bucket_keys_sort_chronologically(
            a in -62_167_219_200_i64..253_402_300_799_i64,
            b in -62_167_219_200_i64..253_402_300_799_i64,
            g in 0_usize..4,
        ) {
            let granularity = Granularity::ALL[g];
            let (Some(ta), Some(tb)) = (DateTime::from_timestamp(a, 0), DateTime::from_timestamp(b, 0)) else {
                return Ok(());
            };
            let ka = bucket_key(Some(granularity), ta);
            let kb = bucket_key(Some(granularity), tb);
            prop_assert_eq!(ka.cmp(&kb), bucket_start(granularity, ta).cmp(&bucket_start(granularity, tb)));
        }
    }
}
