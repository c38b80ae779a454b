use crate::error::CoreError;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Parse an IANA timezone name
pub fn parse_timezone(timezone: &str) -> Result<Tz, CoreError> {
    Tz::from_str(timezone).map_err(|_| CoreError::InvalidTimezone(timezone.to_string()))
}

/// Validate IANA timezone name
pub fn validate_timezone(timezone: &str) -> Result<(), CoreError> {
    parse_timezone(timezone).map(|_| ())
}

/// Resolves a wall-clock date and time in `tz` to a UTC instant.
///
/// Ambiguous local times (DST fall-back) resolve to the earliest instant.
/// Nonexistent local times (DST spring-forward) move forward one hour.
pub fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    if let Some(local) = tz.from_local_datetime(&naive).earliest() {
        return local.with_timezone(&Utc);
    }

    let shifted = naive + chrono::Duration::hours(1);
    match tz.from_local_datetime(&shifted).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => tz.from_utc_datetime(&naive).with_timezone(&Utc),
    }
}

/// Format datetime with timezone-aware display
pub fn format_with_timezone(
    datetime: DateTime<Utc>,
    timezone: &str,
    format: &str,
) -> Result<String, CoreError> {
    let tz = parse_timezone(timezone)?;
    Ok(datetime.with_timezone(&tz).format(format).to_string())
}
