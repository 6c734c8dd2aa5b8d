//! Parsing of user-provided durations such as `--job-timeout`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {input:?}: expected a number of seconds with an optional s, m or h suffix")]
pub struct DurationParseError {
    input: String,
}

/// Parses `<number>[s|m|h]`. The number must be a non-negative integer or decimal using `.`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let err = || DurationParseError {
        input: input.to_owned(),
    };

    let trimmed = input.trim();
    let (number, multiplier) = match trimmed.chars().last() {
        Some('s') => (&trimmed[..trimmed.len() - 1], 1.0),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60.0),
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600.0),
        Some(_) => (trimmed, 1.0),
        None => return Err(err()),
    };

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(err());
    }
    let value: f64 = number.parse().map_err(|_| err())?;
    if !value.is_finite() {
        return Err(err());
    }

    Ok(Duration::from_secs_f64(value * multiplier))
}

#[cfg(test)]
mod test {
    use super::parse_duration;
    use std::time::Duration;

    #[test]
    fn plain_seconds() {
        assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("1s"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_duration("0.5"), Ok(Duration::from_millis(500)));
    }

    #[test]
    fn suffixes() {
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["1,5", "123x", "", "s", "-1", "1.2.3", "1 s", "inf"] {
            assert!(parse_duration(bad).is_err(), "{bad} should be rejected");
        }
    }
}
