//! Exponential backoff with random spread for retry pacing.

use rand::Rng;
use tokio::time::Duration;

/// A doubling delay schedule, capped at `max`, with a random spread added
/// to each step so concurrent retries do not synchronize.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
    spread: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration, spread: Duration) -> Self {
        Self {
            current: min,
            max,
            spread,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current.saturating_add(self.jitter());
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    fn jitter(&self) -> Duration {
        if self.spread.is_zero() {
            return Duration::ZERO;
        }
        let nanos = rand::rng().random_range(0..self.spread.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            Duration::ZERO,
        );

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[test]
    fn spread_stays_bounded() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );

        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay < Duration::from_millis(15));
        }
    }
}
