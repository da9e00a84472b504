//! Formatting helpers for human-readable byte sizes and durations.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Size column of a directory index: `123`, `1.5K`, `2.0M`, `1G`, `4.2 MB`.
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,15})(?:\.(\d{1,3}))?\s?([KMGT]?)(?:i?B)?$").expect("valid regex")
});

/// Binary unit prefixes, largest first, with their power-of-two shift.
const UNITS: [(char, u32); 4] = [('T', 40), ('G', 30), ('M', 20), ('K', 10)];

fn unit_multiplier(prefix: &str) -> Option<u64> {
    if prefix.is_empty() {
        return Some(1);
    }
    UNITS
        .iter()
        .find(|(c, _)| prefix.len() == 1 && prefix.starts_with(*c))
        .map(|(_, shift)| 1u64 << shift)
}

/// Formats a byte count with the largest fitting binary unit, up to TB.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    UNITS
        .iter()
        .find(|(_, shift)| bytes >= 1u64 << shift)
        .map_or_else(
            || format!("{bytes} B"),
            |(prefix, shift)| format!("{:.2} {prefix}B", bytes as f64 / (1u64 << shift) as f64),
        )
}

/// Formats a duration for progress output: `5.0s`, `1m 05s`, `1h 01m 05s`,
/// or `2d 03h 10m` for multi-day projections.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        secs % 86_400 / 3600,
        secs % 3600 / 60,
        secs % 60,
    );
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{seconds}.{:01}s", d.subsec_millis() / 100),
        (0, 0, _) => format!("{minutes}m {seconds:02}s"),
        (0, _, _) => format!("{hours}h {minutes:02}m {seconds:02}s"),
        _ => format!("{days}d {hours:02}h {minutes:02}m"),
    }
}

/// Parses the size column of a directory index into bytes (1024-based units).
///
/// Returns `None` for `-` placeholders and anything unparseable.
#[must_use]
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text.trim())?;
    let whole: u64 = caps.get(1)?.as_str().parse().ok()?;
    let frac = caps.get(2).map_or("", |m| m.as_str());
    let multiplier = unit_multiplier(caps.get(3).map_or("", |m| m.as_str()))?;

    let mut bytes = whole.checked_mul(multiplier)?;
    if !frac.is_empty() {
        let scale = 10u64.pow(u32::try_from(frac.len()).ok()?);
        let frac_value: u64 = frac.parse().ok()?;
        bytes = bytes.checked_add(frac_value.checked_mul(multiplier)? / scale)?;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_sizes_read_naturally() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 << 20), "3.00 MB");
        assert_eq!(format_bytes(1 << 30), "1.00 GB");
        assert_eq!(format_bytes(5 << 40), "5.00 TB");
    }

    #[test]
    fn long_projections_switch_to_days() {
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 01m 05s");
        assert_eq!(format_duration(Duration::from_secs(86_399)), "23h 59m 59s");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "1d 01h 00m");
        assert_eq!(format_duration(Duration::from_secs(86_400 * 40)), "40d 00h 00m");
    }

    #[test]
    fn sizes_round_trip_through_listing_units() {
        for bytes in [1u64 << 10, 1 << 20, 1 << 30, 1 << 40] {
            let shown = format_bytes(bytes);
            let listing = shown.replace(".00 ", "").replace("B", "");
            assert_eq!(parse_size(&listing), Some(bytes), "{shown}");
        }
    }

    #[test]
    fn format_duration_subsecond() {
        assert_eq!(format_duration(Duration::from_millis(500)), "0.5s");
    }

    #[test]
    fn parse_size_plain_and_suffixed() {
        assert_eq!(parse_size("123"), Some(123));
        assert_eq!(parse_size("1K"), Some(1024));
        assert_eq!(parse_size("1.5K"), Some(1536));
        assert_eq!(parse_size("2.0M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("2T"), Some(2 << 40));
        assert_eq!(parse_size(" 4 MB "), Some(4 << 20));
        assert_eq!(parse_size("3KiB"), Some(3072));
    }

    #[test]
    fn parse_size_rejects_placeholders() {
        assert_eq!(parse_size("-"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("12X"), None);
        assert_eq!(parse_size("1.2345M"), None);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn format_bytes_never_panics(bytes in 0u64..u64::MAX) {
                let _ = format_bytes(bytes);
            }

            #[test]
            fn format_duration_never_panics(secs in 0u64..100_000_000) {
                let _ = format_duration(Duration::from_secs(secs));
            }

            #[test]
            fn parse_size_plain_integers(n in 0u64..1_000_000_000_000) {
                prop_assert_eq!(parse_size(&n.to_string()), Some(n));
            }

            #[test]
            fn parse_size_never_panics(s in "\\PC{0,24}") {
                let _ = parse_size(&s);
            }
        }
    }
}
