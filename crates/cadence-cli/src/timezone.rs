use cadence_core::error::CoreError;
use cadence_core::timezone::validate_timezone;

const COMMON_TIMEZONES: &[&str] = &[
    "UTC",
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Los_Angeles",
    "America/Sao_Paulo",
    "Europe/London",
    "Europe/Paris",
    "Europe/Berlin",
    "Europe/Madrid",
    "Asia/Tokyo",
    "Asia/Shanghai",
    "Asia/Kolkata",
    "Asia/Dubai",
    "Australia/Sydney",
    "Pacific/Auckland",
];

/// Detects the system timezone, falling back to UTC if detection fails
pub fn detect_system_timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if validate_timezone(&tz).is_ok() {
            return tz;
        }
    }

    if let Ok(local_tz) = iana_time_zone::get_timezone() {
        if validate_timezone(&local_tz).is_ok() {
            return local_tz;
        }
    }

    "UTC".to_string()
}

/// Convert user-friendly timezone input to an IANA name
pub fn normalize_timezone_input(input: &str) -> Result<String, CoreError> {
    if validate_timezone(input).is_ok() {
        return Ok(input.to_string());
    }

    let normalized = match input.to_lowercase().as_str() {
        "est" | "eastern" => "America/New_York",
        "cst" | "central" => "America/Chicago",
        "mst" | "mountain" => "America/Denver",
        "pst" | "pacific" => "America/Los_Angeles",
        "gmt" | "utc" | "z" => "UTC",
        "bst" | "london" => "Europe/London",
        "cet" | "paris" => "Europe/Paris",
        "berlin" => "Europe/Berlin",
        "jst" | "tokyo" => "Asia/Tokyo",
        _ => {
            let suggestions = suggest_timezone(input);
            return Err(CoreError::InvalidTimezone(if suggestions.is_empty() {
                format!("Unknown timezone '{}'. Use IANA names like 'America/New_York'", input)
            } else {
                format!("Unknown timezone '{}'. Did you mean: {}?", input, suggestions.join(", "))
            }));
        }
    };

    validate_timezone(normalized)?;
    Ok(normalized.to_string())
}

/// Suggests common timezones sharing a fragment with the input
pub fn suggest_timezone(input: &str) -> Vec<String> {
    let needle = input.to_lowercase();
    if needle.len() < 3 {
        return Vec::new();
    }

    COMMON_TIMEZONES
        .iter()
        .filter(|tz| {
            let lower = tz.to_lowercase();
            lower.contains(&needle) || lower.split('/').any(|part| part.len() >= 3 && needle.contains(part))
        })
        .map(|tz| tz.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Europe/Berlin", "Europe/Berlin")]
    #[case("EST", "America/New_York")]
    #[case("pacific", "America/Los_Angeles")]
    #[case("utc", "UTC")]
    fn test_normalize_accepts_known_inputs(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_timezone_input(input).unwrap(), expected);
    }

    #[test]
    fn test_normalize_suggests_close_matches() {
        let err = normalize_timezone_input("Europe/Berlinn").unwrap_err();
        assert!(err.to_string().contains("Europe/Berlin"));
    }

    #[test]
    fn test_detect_never_returns_invalid_zone() {
        assert!(validate_timezone(&detect_system_timezone()).is_ok());
    }
}
