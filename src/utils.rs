use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Duration;

/// Parses a run-length string such as `"90s"`, `"10m"`, `"2h"` or `"1d"`.
///
/// A bare number is taken as seconds.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("Invalid numeric value in duration: '{}'", s))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => {
            return Err(format!(
                "Unknown duration unit '{}' in '{}' (expected s, m, h or d)",
                other, s
            ))
        }
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration '{}' is too large", s))
}

/// Parses a comma-separated list, dropping blank items.
pub fn parse_name_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Wall-clock seconds since the unix epoch. Snapshots from different
/// nodes are merged on this clock.
pub fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Best-effort host name for node identifiers.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_units() {
        let cases = [
            ("45", 45),
            ("90s", 90),
            ("10m", 600),
            ("2h", 7_200),
            ("1d", 86_400),
            ("  5m ", 300),
        ];
        for (input, secs) in cases {
            assert_eq!(
                parse_duration_string(input).unwrap(),
                Duration::from_secs(secs),
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn test_duration_rejects_garbage() {
        assert!(parse_duration_string("").unwrap_err().contains("empty"));
        assert!(parse_duration_string("m").unwrap_err().contains("Invalid numeric"));
        assert!(parse_duration_string("-5m").unwrap_err().contains("Invalid numeric"));
        assert!(parse_duration_string("10x").unwrap_err().contains("Unknown duration unit"));
        assert!(parse_duration_string("1.5h").unwrap_err().contains("Unknown duration unit"));
        assert!(parse_duration_string("forever").is_err());
    }

    #[test]
    fn test_duration_overflow() {
        let err = parse_duration_string("18446744073709551615d").unwrap_err();
        assert!(err.contains("too large"), "error was: {}", err);
    }

    #[test]
    fn test_name_list_skips_blanks() {
        assert_eq!(
            parse_name_list(" browse, ,checkout ,"),
            vec!["browse".to_string(), "checkout".to_string()]
        );
        assert!(parse_name_list("").is_empty());
    }
}
