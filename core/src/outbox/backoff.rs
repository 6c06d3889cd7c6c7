//! Exponential backoff with jitter, capped at `max_backoff` (spec §4.2).
//!
//! Grounded on `event_bus::consumer_retry`'s `backoff = min(backoff * 2,
//! max_backoff)` doubling, extended with jitter since the relay's backoff
//! (unlike the consumer retry helper) must avoid many workers reclaiming
//! the same stuck rows in lockstep.

use chrono::Duration as ChronoDuration;
use rand::Rng;
use std::time::Duration;

const BASE: Duration = Duration::from_millis(500);

/// `attempts` is the attempt count *after* the failure being backed off
/// from (i.e. the first failure passes `attempts = 1`).
pub fn compute(attempts: i32, max_backoff: ChronoDuration) -> ChronoDuration {
    let attempts = attempts.max(1) as u32;
    let exp = BASE.saturating_mul(1u32.checked_shl(attempts.min(20)).unwrap_or(u32::MAX));
    let capped = exp.min(
        max_backoff
            .to_std()
            .unwrap_or(Duration::from_secs(5 * 60)),
    );

    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    let jittered = capped.mul_f64(jitter_fraction);

    ChronoDuration::from_std(jittered).unwrap_or_else(|_| ChronoDuration::seconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts_but_never_exceeds_cap() {
        let max = ChronoDuration::seconds(60);
        for attempts in 1..10 {
            let delay = compute(attempts, max);
            assert!(delay <= max, "attempt {attempts} exceeded cap: {delay:?}");
            assert!(delay > ChronoDuration::zero());
        }
    }

    #[test]
    fn backoff_eventually_saturates_at_the_cap() {
        let max = ChronoDuration::seconds(10);
        let delay = compute(30, max);
        assert!(delay <= max);
    }
}
