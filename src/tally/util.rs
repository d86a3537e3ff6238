use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Current wall-clock instant. Only used for bookkeeping fields such as
/// `cached_at`, never for bucketing or window bounds.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Truncate `input` to at most `max_chars` characters, stripping control
/// characters and appending `…` when truncated.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    let clean: String = input.chars().filter(|c| !c.is_control()).collect();
    if clean.chars().count() > max_chars {
        let mut s: String = clean.chars().take(max_chars).collect();
        s.push('…');
        s
    } else {
        clean
    }
}

/// Round to two decimals for report lines.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
