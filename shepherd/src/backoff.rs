//! Exponential restart backoff.
//!
//! The raw delay is `min(backoff_max, base · 2^(n−1))` for the n-th
//! consecutive failure; scheduling applies ±20% jitter on top so that a
//! fleet of runs failing together does not hammer the scheduler in lockstep.

use rand::Rng;

/// Jitter ratio applied when scheduling a computed delay.
pub const JITTER_RATIO: f64 = 0.2;

/// Compute the raw (jitter-free) backoff delay in seconds.
///
/// Zero consecutive failures means no delay. The exponent saturates well
/// before `i32::MAX` so large failure counts cannot overflow.
pub fn compute_delay(consecutive_failures: u32, base_sec: i64, max_sec: i64) -> i64 {
    if consecutive_failures == 0 || base_sec <= 0 {
        return 0;
    }
    let exp = consecutive_failures.saturating_sub(1).min(32) as i32;
    let scaled = (base_sec as f64) * 2f64.powi(exp);
    let capped = scaled.min(max_sec.max(0) as f64);
    capped as i64
}

/// Apply ±`JITTER_RATIO` jitter to a delay using the given RNG.
pub fn apply_jitter<R: Rng>(delay_sec: i64, rng: &mut R) -> i64 {
    if delay_sec <= 0 {
        return 0;
    }
    let factor = rng.gen_range(1.0 - JITTER_RATIO..=1.0 + JITTER_RATIO);
    ((delay_sec as f64) * factor).round() as i64
}

/// Compute the jittered delay for the n-th consecutive failure.
pub fn jittered_delay(consecutive_failures: u32, base_sec: i64, max_sec: i64) -> i64 {
    let raw = compute_delay(consecutive_failures, base_sec, max_sec);
    apply_jitter(raw, &mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_growth() {
        // First failure waits the base, then doubles.
        assert_eq!(compute_delay(1, 10, 300), 10);
        assert_eq!(compute_delay(2, 10, 300), 20);
        assert_eq!(compute_delay(3, 10, 300), 40);
        assert_eq!(compute_delay(4, 10, 300), 80);
    }

    #[test]
    fn test_delay_capped() {
        assert_eq!(compute_delay(6, 10, 300), 300);
        assert_eq!(compute_delay(60, 10, 300), 300);
    }

    #[test]
    fn test_no_failures_no_delay() {
        assert_eq!(compute_delay(0, 10, 300), 0);
        assert_eq!(compute_delay(5, 0, 300), 0);
    }

    #[test]
    fn test_monotonic_until_cap() {
        let mut last = 0;
        for n in 1..20 {
            let delay = compute_delay(n, 7, 500);
            assert!(delay >= last, "delay shrank at n={n}");
            last = delay;
        }
        assert_eq!(last, 500);
    }

    #[test]
    fn test_jitter_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let jittered = apply_jitter(100, &mut rng);
            assert!((80..=120).contains(&jittered), "jitter out of range: {jittered}");
        }
        assert_eq!(apply_jitter(0, &mut rng), 0);
    }
}
