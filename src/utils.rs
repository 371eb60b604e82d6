// Shared utility functions

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// This is useful when you want to continue even if a previous thread panicked.
/// The mutex state may be inconsistent, so use with caution.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Compute the delay before the next retry of a transient operation.
///
/// Exponential in the attempt number (0-based), capped, with a random jitter
/// so concurrent retries against the shared object store don't realign.
pub fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    use rand::Rng;

    let exp = base_ms.saturating_mul(1u64 << attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mutex_recover() {
        let mutex = Mutex::new(5);
        let guard = lock_mutex_recover(&mutex);
        assert_eq!(*guard, 5);
    }

    #[test]
    fn test_backoff_delay_grows() {
        let base = 100;
        let first = backoff_delay(0, base);
        let third = backoff_delay(2, base);
        assert!(first.as_millis() >= 100);
        assert!(third.as_millis() >= 400);
        // Jitter is bounded by half the base
        assert!(first.as_millis() <= 150);
    }

    #[test]
    fn test_backoff_delay_caps_exponent() {
        // Very large attempt numbers must not overflow
        let delay = backoff_delay(u32::MAX, 100);
        assert!(delay.as_millis() <= (100 * 32 + 50) as u128);
    }
}
