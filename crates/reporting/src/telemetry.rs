//! Telemetry
//!
//! Counters and histograms exported through the `metrics` facade when the
//! `metrics` feature is enabled. Without the feature every call is a no-op.

use std::time::Duration;

use crate::{evaluator::Evaluator, keys::Granularity};

/// Committed cell updates
pub const CELL_UPDATES_TOTAL: &str = "reporting_cell_updates_total";

/// Failed cell updates
pub const CELL_UPDATE_FAILURES_TOTAL: &str = "reporting_cell_update_failures_total";

/// Save call latency
pub const SAVE_DURATION_SECONDS: &str = "reporting_save_duration_seconds";

/// Retainer range reads
pub const RANGE_READS_TOTAL: &str = "reporting_range_reads_total";

/// Record the outcome of one cell transaction
#[cfg(feature = "metrics")]
pub(crate) fn record_cell_update(evaluator: Evaluator, committed: bool) {
    let name = if committed {
        CELL_UPDATES_TOTAL
    } else {
        CELL_UPDATE_FAILURES_TOTAL
    };
    metrics::counter!(name, "evaluator" => evaluator.as_str()).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cell_update(_evaluator: Evaluator, _committed: bool) {}

/// Record the latency of one save call
#[cfg(feature = "metrics")]
pub(crate) fn record_save_duration(duration: Duration) {
    metrics::histogram!(SAVE_DURATION_SECONDS).record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_save_duration(_duration: Duration) {}

/// Record one retainer range read
#[cfg(feature = "metrics")]
pub(crate) fn record_range_read(granularity: Granularity) {
    metrics::counter!(RANGE_READS_TOTAL, "granularity" => granularity.as_str()).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_range_read(_granularity: Granularity) {}
