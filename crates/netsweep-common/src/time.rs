//! Time-suffix parsing and unix-time helpers.
//!
//! Rule delays and failover intervals are written with an optional suffix:
//! `30` (seconds), `90s`, `5m`, `2h`, `1d`, `1w`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::error::{NetsweepError, Result};

/// Parses a time interval with an optional suffix into seconds.
pub fn parse_time_suffix(input: &str) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(NetsweepError::InvalidInterval(input.to_string()));
    }

    let (digits, multiplier) = match input.as_bytes()[input.len() - 1] {
        b's' => (&input[..input.len() - 1], 1),
        b'm' => (&input[..input.len() - 1], 60),
        b'h' => (&input[..input.len() - 1], 3600),
        b'd' => (&input[..input.len() - 1], 86_400),
        b'w' => (&input[..input.len() - 1], 604_800),
        _ => (input, 1),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| NetsweepError::InvalidInterval(input.to_string()))?;
    if value < 0 {
        return Err(NetsweepError::InvalidInterval(input.to_string()));
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| NetsweepError::InvalidInterval(input.to_string()))
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_parsing() {
        assert_eq!(parse_time_suffix("30").unwrap(), 30);
        assert_eq!(parse_time_suffix("90s").unwrap(), 90);
        assert_eq!(parse_time_suffix("5m").unwrap(), 300);
        assert_eq!(parse_time_suffix("2h").unwrap(), 7200);
        assert_eq!(parse_time_suffix("1d").unwrap(), 86_400);
        assert_eq!(parse_time_suffix("1w").unwrap(), 604_800);
    }

    #[test]
    fn test_invalid_intervals() {
        assert!(parse_time_suffix("").is_err());
        assert!(parse_time_suffix("abc").is_err());
        assert!(parse_time_suffix("-5s").is_err());
        assert!(parse_time_suffix("{$DELAY}").is_err());
    }
}
