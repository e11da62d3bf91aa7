//! Compact timeout encoding used to propagate deadlines in `Open` frames.
//!
//! The format is up to 8 ASCII digits followed by a unit: `H` hours,
//! `M` minutes, `S` seconds, `m` milliseconds, `u` microseconds,
//! `n` nanoseconds.

use std::time::Duration;

const MAX_DIGITS: usize = 8;
const MAX_VALUE: u128 = 99_999_999;

/// Parse a timeout string. Returns `None` for anything malformed.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > MAX_DIGITS + 1 {
        return None;
    }
    // Bytes, not chars: the value comes off the wire and may hold any UTF-8.
    let (unit, digits) = value.as_bytes().split_last()?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let num = digits
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));

    match unit {
        b'H' => Some(Duration::from_secs(num * 3600)),
        b'M' => Some(Duration::from_secs(num * 60)),
        b'S' => Some(Duration::from_secs(num)),
        b'm' => Some(Duration::from_millis(num)),
        b'u' => Some(Duration::from_micros(num)),
        b'n' => Some(Duration::from_nanos(num)),
        _ => None,
    }
}

/// Format a duration using the finest unit whose value fits in 8 digits.
///
/// Values that do not divide evenly are rounded up, so the peer never sees a
/// deadline earlier than the caller asked for.
pub fn format_timeout(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    let units: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60 * 1_000_000_000, 'M'),
        (3600 * 1_000_000_000, 'H'),
    ];
    for (scale, unit) in units {
        let value = nanos.div_ceil(scale);
        if value <= MAX_VALUE {
            return format!("{value}{unit}");
        }
    }
    format!("{MAX_VALUE}H")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_timeout("10S"), Some(Duration::from_secs(10)));
        assert_eq!(parse_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_timeout("5u"), Some(Duration::from_micros(5)));
        assert_eq!(parse_timeout("7n"), Some(Duration::from_nanos(7)));
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("S"), None);
        assert_eq!(parse_timeout("10x"), None);
        assert_eq!(parse_timeout("-1S"), None);
        assert_eq!(parse_timeout("123456789S"), None);
        // Multi-byte characters must not split a char boundary.
        assert_eq!(parse_timeout("1é"), None);
        assert_eq!(parse_timeout("é5"), None);
        assert_eq!(parse_timeout("10\u{1F600}"), None);
    }

    #[test]
    fn format_picks_finest_fitting_unit() {
        assert_eq!(format_timeout(Duration::ZERO), "0n");
        assert_eq!(format_timeout(Duration::from_millis(1)), "1000000n");
        assert_eq!(format_timeout(Duration::from_secs(1)), "1000000u");
        assert_eq!(format_timeout(Duration::from_secs(100)), "100000m");
        assert_eq!(
            parse_timeout(&format_timeout(Duration::from_secs(100))),
            Some(Duration::from_secs(100))
        );
    }
}
