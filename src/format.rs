//! Human-readable rate formatting.

/// Returned when the elapsed time is too small to compute a rate.
pub const TOO_FAST: &str = "(too fast)";

/// Decimal unit prefixes, in increasing order of magnitude.
const DECIMAL_PREFIXES: &str = "kMGTPE";

/// Format a transfer of `total_bytes` over `elapsed_secs` as bits per second.
///
/// Non-positive (or NaN) durations yield [`TOO_FAST`] instead of a division.
pub fn format_bit_rate(elapsed_secs: f64, total_bytes: u64) -> String {
    if elapsed_secs.is_nan() || elapsed_secs <= 0.0 {
        return TOO_FAST.to_string();
    }

    // Float to int conversion saturates, so an absurd rate cannot overflow.
    let bits_per_sec = (total_bytes as f64 * 8.0 / elapsed_secs) as u64;
    format!("{}bps", byte_count_decimal(bits_per_sec))
}

/// Format `value` with decimal prefixes, leaving room for a unit suffix.
///
/// `999` becomes `"999 "`, `1500` becomes `"1.5 k"`.
pub fn byte_count_decimal(value: u64) -> String {
    let (number, unit) = byte_count(value, 1000, DECIMAL_PREFIXES);
    format!("{number} {unit}")
}

/// Scale `value` by powers of `base`, returning the number and its prefix.
///
/// Falls back to the raw integer with an empty prefix when the magnitude
/// runs past the last prefix in `prefixes`.
fn byte_count(value: u64, base: u64, prefixes: &str) -> (String, &str) {
    if value < base {
        return (value.to_string(), "");
    }

    let mut div = base;
    let mut exp = 0;
    let mut n = value / base;
    while n >= base {
        div = match div.checked_mul(base) {
            Some(d) => d,
            None => return (value.to_string(), ""),
        };
        exp += 1;
        n /= base;
    }

    match prefixes.get(exp..exp + 1) {
        Some(prefix) => (format!("{:.1}", value as f64 / div as f64), prefix),
        None => (value.to_string(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_fast() {
        assert_eq!(format_bit_rate(0.0, 1_000_000), TOO_FAST);
        assert_eq!(format_bit_rate(-1.5, 1_000_000), TOO_FAST);
        assert_eq!(format_bit_rate(f64::NAN, 10), TOO_FAST);
    }

    #[test]
    fn test_one_kilobit() {
        assert_eq!(format_bit_rate(1.0, 125), "1.0 kbps");
    }

    #[test]
    fn test_below_first_prefix() {
        assert_eq!(format_bit_rate(1.0, 0), "0 bps");
        assert_eq!(format_bit_rate(8.0, 999), "999 bps");
    }

    #[test]
    fn test_larger_prefixes() {
        // 10 GB in 10 s = 8 Gbps
        assert_eq!(format_bit_rate(10.0, 10_000_000_000), "8.0 Gbps");
        assert_eq!(format_bit_rate(2.0, 3_125_000), "12.5 Mbps");
        assert_eq!(byte_count_decimal(1_500), "1.5 k");
        assert_eq!(byte_count_decimal(999_999), "1000.0 k");
    }

    #[test]
    fn test_saturating_rate() {
        assert_eq!(format_bit_rate(1e-300, u64::MAX), "18.4 Ebps");
        assert_eq!(byte_count_decimal(u64::MAX), "18.4 E");
    }

    #[test]
    fn test_prefix_exhaustion() {
        assert_eq!(byte_count(5_000_000, 1000, "k"), ("5000000".to_string(), ""));
        assert_eq!(byte_count(5_000, 1000, "k"), ("5.0".to_string(), "k"));
        assert_eq!(byte_count(5_000, 1000, ""), ("5000".to_string(), ""));
    }
}
