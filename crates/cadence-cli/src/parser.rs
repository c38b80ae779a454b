use cadence_core::timezone::resolve_local;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_english::{parse_date_string, Dialect};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum InputError {
    #[error("Failed to parse date '{0}': {1}")]
    Date(String, String),
    #[error("Invalid time of day '{0}'. Use forms like '09:00' or '5:30 PM'")]
    Time(String),
    #[error("Invalid weekday '{0}'. Use mon, tue, wed, thu, fri, sat or sun")]
    Weekday(String),
    #[error("Invalid day of month '{0}'. Use 1..=31 or -31..=-1")]
    MonthDay(String),
}

const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p", "%I %p", "%I%p"];

/// Parses a natural-language date ("tomorrow", "next monday", "2025-03-01")
/// as a calendar day in `tz`.
pub fn parse_date(input: &str, tz: Tz, now: DateTime<Utc>) -> Result<NaiveDate, InputError> {
    if let Ok(date) = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d") {
        return Ok(date);
    }

    parse_date_string(input, now.with_timezone(&tz), Dialect::Uk)
        .map(|dt| dt.date_naive())
        .map_err(|e| InputError::Date(input.to_string(), e.to_string()))
}

pub fn parse_time_of_day(input: &str) -> Result<NaiveTime, InputError> {
    let normalized = input.trim().to_uppercase();
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(&normalized, format).ok())
        .ok_or_else(|| InputError::Time(input.to_string()))
}

/// Accepts a comma-separated weekday list, or `weekdays` / `weekends`.
pub fn parse_weekdays(input: &str) -> Result<Vec<Weekday>, InputError> {
    match input.trim().to_lowercase().as_str() {
        "weekdays" => {
            return Ok(vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]);
        }
        "weekends" => return Ok(vec![Weekday::Sat, Weekday::Sun]),
        _ => {}
    }

    let mut days = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day = parse_weekday(part)?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    if days.is_empty() {
        return Err(InputError::Weekday(input.to_string()));
    }
    Ok(days)
}

pub fn parse_weekday(input: &str) -> Result<Weekday, InputError> {
    input.trim().parse::<Weekday>().map_err(|_| InputError::Weekday(input.to_string()))
}

pub fn parse_month_days(input: &str) -> Result<Vec<i8>, InputError> {
    input
        .split(',')
        .map(str::trim)
        .map(|part| match part.parse::<i8>() {
            Ok(day) if day != 0 && (-31..=31).contains(&day) => Ok(day),
            _ => Err(InputError::MonthDay(part.to_string())),
        })
        .collect()
}

/// The UTC instant of `time` on `date` in `tz`.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    resolve_local(&tz, date, time)
}

/// End of `date` in `tz`, used for inclusive `--until` bounds.
pub fn end_of_day(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
    resolve_local(&tz, date, last_second)
}
