//! Size-literal grammar used by `maxMemory` and the health thresholds.
//!
//! Split out as its own module so `parse_size`/`format_size` can be
//! unit-tested against the round-trip law `parse_size(format_size(n)) == n`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{NodeDaemonError, Result};

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([0-9]+(?:\.[0-9]+)?)\s*(B|KB|MB|GB|TB|PB)\s*$").unwrap()
});

const UNITS: [(&str, u64); 6] = [
    ("B", 1),
    ("KB", 1024),
    ("MB", 1024 * 1024),
    ("GB", 1024 * 1024 * 1024),
    ("TB", 1024u64.pow(4)),
    ("PB", 1024u64.pow(5)),
];

/// Parses a size literal such as `"512MB"` or `"1.5 GB"` into a byte count.
pub fn parse_size(literal: &str) -> Result<u64> {
    let caps = SIZE_RE
        .captures(literal)
        .ok_or_else(|| NodeDaemonError::invalid_config(format!("invalid size literal: {literal:?}")))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| NodeDaemonError::invalid_config(format!("invalid size literal: {literal:?}")))?;
    let unit = caps[2].to_uppercase();

    let multiplier = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, mult)| *mult)
        .ok_or_else(|| NodeDaemonError::invalid_config(format!("unknown size unit: {unit}")))?;

    Ok((value * multiplier as f64).round() as u64)
}

/// Formats a byte count back into the largest whole unit that divides it
/// evenly, falling back to megabytes with one decimal place otherwise.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0B".to_string();
    }

    for (name, mult) in UNITS.iter().rev() {
        if *mult > 1 && bytes % mult == 0 {
            return format!("{}{name}", bytes / mult);
        }
    }

    let mb = bytes as f64 / (1024.0 * 1024.0);
    format!("{mb:.1}MB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit_case_insensitively() {
        assert_eq!(parse_size("10B").unwrap(), 10);
        assert_eq!(parse_size("1kb").unwrap(), 1024);
        assert_eq!(parse_size("1 MB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5mb").unwrap(), (1.5 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!(parse_size("").is_err());
        assert!(parse_size("512").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("-1MB").is_err());
    }

    #[test]
    fn format_then_parse_round_trips_for_whole_units() {
        for n in [0u64, 1024, 1024 * 1024, 500 * 1024 * 1024, 5 * 1024 * 1024 * 1024] {
            let formatted = format_size(n);
            if n == 0 {
                assert_eq!(formatted, "0B");
                continue;
            }
            let parsed = parse_size(&formatted).unwrap();
            assert_eq!(parsed, n, "round trip failed for {n} -> {formatted}");
        }
    }
}
