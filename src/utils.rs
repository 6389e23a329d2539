//! Shared helpers for date ranges and run reporting.

use std::time::Duration;

use chrono::NaiveDate;

/// Expand an inclusive date range into the ordered list of dates.
///
/// Returns an empty vector when `start > end`; callers validate the range
/// before scheduling work.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current);
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    dates
}

/// Timestamp string for the first second of a date, as the store expects it.
pub fn day_start(date: NaiveDate) -> String {
    format!("{date} 00:00:00")
}

/// Timestamp string for the last second of a date.
pub fn day_end(date: NaiveDate) -> String {
    format!("{date} 23:59:59")
}

/// Format a duration as `XmYs` for run summaries.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}m {}s", total / 60, total % 60)
}
