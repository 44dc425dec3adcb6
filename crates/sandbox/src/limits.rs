//! Resource-limit parsing for workspace containers.

/// Memory limit applied when a request's limit is missing or malformed.
pub const DEFAULT_MEMORY_BYTES: i64 = 512 * 1024 * 1024;

/// CPU count applied when a request's limit is missing or malformed.
pub const DEFAULT_CPUS: f64 = 1.0;

const NANO_CPUS_PER_CPU: f64 = 1_000_000_000.0;

/// Parse `<integer>[b|k|m|g]` (case-insensitive) into bytes.
///
/// The whole string must match; surrounding whitespace is malformed. Anything
/// that does not match, or overflows, yields [`DEFAULT_MEMORY_BYTES`]. A
/// matching zero is passed through, and Docker reads it as unlimited.
pub fn parse_memory_limit(limit: &str) -> i64 {
    let Some(unit) = limit.chars().last() else {
        return DEFAULT_MEMORY_BYTES;
    };

    let multiplier: i64 = match unit.to_ascii_lowercase() {
        'b' => 1,
        'k' => 1024,
        'm' => 1024 * 1024,
        'g' => 1024 * 1024 * 1024,
        _ => return DEFAULT_MEMORY_BYTES,
    };

    let digits = &limit[..limit.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return DEFAULT_MEMORY_BYTES;
    }

    digits
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .unwrap_or(DEFAULT_MEMORY_BYTES)
}

/// Parse a CPU count such as `"1"` or `"0.5"` into Docker nano-CPUs.
pub fn parse_cpu_limit(limit: &str) -> i64 {
    let cpus = limit
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|c| c.is_finite() && *c > 0.0)
        .unwrap_or(DEFAULT_CPUS);
    (cpus * NANO_CPUS_PER_CPU) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_units() {
        assert_eq!(parse_memory_limit("256m"), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("2G"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64k"), 64 * 1024);
        assert_eq!(parse_memory_limit("100b"), 100);
        assert_eq!(parse_memory_limit("0m"), 0);
    }

    #[test]
    fn test_memory_malformed_falls_back() {
        assert_eq!(parse_memory_limit("bogus"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit(""), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("m"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("512"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("1.5g"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("-5m"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit(" 256m "), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("256m\n"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("99999999999999999999g"), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_limit("5é"), DEFAULT_MEMORY_BYTES);
    }

    #[test]
    fn test_cpu_limits() {
        assert_eq!(parse_cpu_limit("1"), 1_000_000_000);
        assert_eq!(parse_cpu_limit("0.5"), 500_000_000);
        assert_eq!(parse_cpu_limit("two"), 1_000_000_000);
        assert_eq!(parse_cpu_limit("-1"), 1_000_000_000);
        assert_eq!(parse_cpu_limit("NaN"), 1_000_000_000);
    }
}
