//! Monotonic time and opaque identifiers.
//!
//! Kept as its own small leaf module because every other component depends
//! on it and nothing in it depends on anything else in the crate.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque globally-unique identifier for a `ManagedProcess` or
/// `ProcessInstance`. A newtype rather than a bare `Uuid` so the two id
/// spaces can't be mixed up at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(Uuid);

impl Id {
    pub fn new() -> Self {
        Id(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Id {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Id(Uuid::parse_str(s)?))
    }
}

/// Wall-clock timestamp, used anywhere a value crosses the persistence or
/// wire boundary (both need a stable serialized representation).
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Monotonic instant, used for uptime/backoff arithmetic that must never
/// regress across a system clock adjustment.
pub fn now_monotonic() -> Instant {
    Instant::now()
}

/// `now - since`, saturating at zero instead of panicking if `since` is
/// somehow in the future (defensive against clock-source swaps in tests).
pub fn elapsed_since(since: Instant) -> Duration {
    Instant::now().saturating_duration_since(since)
}

/// Renders a duration the way the CLI prints process uptime. Total: defined
/// for every input including zero.
pub fn format_uptime(d: Duration) -> String {
    let total_secs = d.as_secs();
    if total_secs == 0 {
        return "0s".to_string();
    }

    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_uptime_zero_is_0s() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
    }

    #[test]
    fn format_uptime_composes_units() {
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m 1s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
    }

    #[test]
    fn ids_round_trip_through_display_and_parse() {
        let id = Id::new();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Id::new(), Id::new());
    }
}
