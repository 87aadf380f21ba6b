//! Timestamp formats used in build properties and log file names.

use crate::{Error, Result};
use chrono::{Local, NaiveDateTime, TimeZone, Utc};

/// Compact timestamp format, e.g. `20011122120000`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Format used for `cvstimestamp`, always rendered in GMT.
pub const CVS_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S GMT";

/// Current local wall-clock time.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn format_timestamp(time: &NaiveDateTime) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|e| Error::InvalidTimestamp(format!("{}: {}", value, e)))
}

/// Render a local time as a GMT `cvstimestamp`.
pub fn format_cvs_timestamp(time: &NaiveDateTime) -> String {
    let utc = match Local.from_local_datetime(time).earliest() {
        Some(local) => local.with_timezone(&Utc).naive_utc(),
        // Nonexistent local time (DST gap); fall back to treating it as UTC.
        None => *time,
    };
    utc.format(CVS_TIMESTAMP_FORMAT).to_string()
}
