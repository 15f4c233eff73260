//! Time step parsing.

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parse an ISO 8601 time step.
///
/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC), or a
/// bare date (midnight UTC).
pub fn parse_time(s: &str) -> RegistryResult<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    if let Some(ndt) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(RegistryError::InvalidTime(s.to_string()))
}
