//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Delay before reconnection attempt `attempt` (zero-based).
///
/// `min(base * 2^attempt, cap) * (1 + U(0, jitter_ratio))`, so with a 10% ratio
/// every delay lands in `[capped, capped * 1.1]`.
pub fn reconnect_delay(attempt: u32, base_ms: u64, cap_ms: u64, jitter_ratio: f64) -> Duration {
    let capped = exponential_ms(attempt, base_ms, cap_ms);

    let jitter = if jitter_ratio > 0.0 {
        rand::thread_rng().gen_range(0.0..=jitter_ratio)
    } else {
        0.0
    };

    Duration::from_millis((capped as f64 * (1.0 + jitter)) as u64)
}

/// Un-jittered `min(base * 2^exponent, cap)`.
pub fn exponential_delay(exponent: u32, base_ms: u64, cap_ms: u64) -> Duration {
    Duration::from_millis(exponential_ms(exponent, base_ms, cap_ms))
}

fn exponential_ms(exponent: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let factor = 2u64.saturating_pow(exponent);
    base_ms.saturating_mul(factor).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_bounds() {
        for k in 0..5u32 {
            let floor = 1000u64 * 2u64.pow(k);
            for _ in 0..50 {
                let d = reconnect_delay(k, 1000, 30_000, 0.1).as_millis() as u64;
                assert!(d >= floor, "attempt {k}: {d} < {floor}");
                assert!(d <= floor + floor / 10, "attempt {k}: {d} too large");
            }
        }
    }

    #[test]
    fn test_reconnect_delay_cap() {
        for _ in 0..50 {
            let d = reconnect_delay(10, 1000, 30_000, 0.1).as_millis();
            assert!((30_000..=33_000).contains(&d));
        }
    }

    #[test]
    fn test_exponential_delay() {
        assert_eq!(exponential_delay(0, 5000, 60_000), Duration::from_secs(5));
        assert_eq!(exponential_delay(2, 5000, 60_000), Duration::from_secs(20));
        assert_eq!(exponential_delay(8, 5000, 60_000), Duration::from_secs(60));
        assert_eq!(exponential_delay(u32::MAX, 5000, 60_000), Duration::from_secs(60));
    }
}
