//! Duration parsing for config values.
//!
//! Config documents write durations either as a bare number of seconds or
//! as a humantime string such as `"90s"` or `"5m"`.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a JSON config value into a [`Duration`].
pub fn parse_duration(value: &serde_json::Value) -> Result<Duration> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(secs) = n.as_u64() {
                Ok(Duration::from_secs(secs))
            } else if let Some(secs) = n.as_f64() {
                if secs < 0.0 {
                    return Err(Error::Validation(format!("negative duration: {secs}")));
                }
                Ok(Duration::from_secs_f64(secs))
            } else {
                Err(Error::Validation(format!("invalid duration: {n}")))
            }
        }
        serde_json::Value::String(s) => humantime::parse_duration(s)
            .map_err(|e| Error::Validation(format!("invalid duration '{s}': {e}"))),
        other => Err(Error::Validation(format!("invalid duration: {other}"))),
    }
}

/// Parse an optional duration config key, with a default.
pub fn parse_duration_or(
    config: &serde_json::Value,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match config.get(key) {
        Some(value) => parse_duration(value),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_seconds_and_strings() {
        assert_eq!(parse_duration(&json!(60)).unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration(&json!("5m")).unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(&json!("1h 30m")).unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration(&json!("sideways")).is_err());
        assert!(parse_duration(&json!(true)).is_err());
        assert!(parse_duration(&json!(-1)).is_err());
    }

    #[test]
    fn default_applies_when_missing() {
        let cfg = json!({"period": "1s"});
        assert_eq!(
            parse_duration_or(&cfg, "timeout", Duration::ZERO).unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            parse_duration_or(&cfg, "period", Duration::ZERO).unwrap(),
            Duration::from_secs(1)
        );
    }
}
