//! Timespan parsing
//!
//! Run times are given in the load-generation tool's own shorthand
//! ("300s", "20m", "3h", "1h30m", or a bare number of seconds), so the
//! orchestrator accepts the same syntax for `--run-time` and `--lock-hold`.

use anyhow::{bail, Result};
use std::time::Duration;

/// Parse a timespan like "90", "120s", "5m", "2h" or "1h30m" into a duration.
pub fn parse_timespan(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        bail!("empty timespan");
    }

    // bare number of seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut seen_unit = false;

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            bail!("invalid timespan '{}': unit without a number", input);
        }
        let value: u64 = digits.parse()?;
        digits.clear();
        seen_unit = true;
        match c {
            's' => total += value,
            'm' => total += value * 60,
            'h' => total += value * 3600,
            other => bail!("invalid timespan '{}': unknown unit '{}'", input, other),
        }
    }

    if !digits.is_empty() || !seen_unit {
        bail!(
            "invalid timespan '{}': expected something like 20s, 3m, 2h or 1h30m",
            input
        );
    }

    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_seconds() {
        assert_eq!(parse_timespan("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timespan("0").unwrap(), Duration::from_secs(0));
    }

    #[test]
    fn test_single_units() {
        assert_eq!(parse_timespan("120s").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_timespan("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_timespan("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_combined_units() {
        assert_eq!(
            parse_timespan("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_timespan("1h30m15s").unwrap(),
            Duration::from_secs(5415)
        );
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        assert_eq!(parse_timespan(" 10s ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(parse_timespan("").is_err());
        assert!(parse_timespan("h").is_err());
        assert!(parse_timespan("10x").is_err());
        assert!(parse_timespan("10s5").is_err());
        assert!(parse_timespan("ten seconds").is_err());
    }
}
