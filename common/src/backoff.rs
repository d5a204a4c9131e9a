use std::cmp::min;
use std::time::Duration;

const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

crate::const_assert!(INITIAL_WAIT_MS != 0);

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// `tokio::time::sleep` to observe time-based exponential backoff.
pub fn get_backoff_iter() -> impl Iterator<Item = Duration> {
    iter_with_initial_wait_ms(INITIAL_WAIT_MS)
}

/// Like [`get_backoff_iter`], but allows specifying the initial wait time in
/// milliseconds.
pub fn iter_with_initial_wait_ms(
    initial_wait_ms: u64,
) -> impl Iterator<Item = Duration> {
    // The initial wait being greater than the maximum wait won't cause any
    // problems, but the programmer probably didn't intend this.
    debug_assert!(initial_wait_ms <= MAXIMUM_WAIT_MS);

    (0u32..).map(move |index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = initial_wait_ms.saturating_mul(factor);
        let bounded_wait_ms = min(wait_ms, MAXIMUM_WAIT_MS);
        Duration::from_millis(bounded_wait_ms)
    })
}

/// The webhook delivery retry schedule: 1, 5, 15, 60, 360 minutes.
/// Returns `None` once the attempt budget (5) is exhausted.
pub fn webhook_delivery_delay(attempt: u32) -> Option<Duration> {
    const MINUTES: [u64; 5] = [1, 5, 15, 60, 360];
    MINUTES
        .get(attempt as usize)
        .map(|mins| Duration::from_secs(mins * 60))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_integer_overflow() {
        let mut backoff_durations = get_backoff_iter();
        for _ in 0..200 {
            backoff_durations.next();
        }
    }

    #[test]
    fn webhook_schedule_exhausts() {
        assert_eq!(
            webhook_delivery_delay(0),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            webhook_delivery_delay(4),
            Some(Duration::from_secs(360 * 60))
        );
        assert_eq!(webhook_delivery_delay(5), None);
    }
}
