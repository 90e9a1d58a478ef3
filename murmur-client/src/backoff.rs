use std::time::Duration;

/// Exponential backoff doubling from `base` up to `max`
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Backoff {
        let max = max.max(base);
        Backoff {
            base,
            max,
            current: base,
            consecutive_failures: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset(&mut self) {
        if self.consecutive_failures > 0 {
            tracing::debug!(
                consecutive_failures = self.consecutive_failures,
                "recovered, resetting backoff"
            );
        }
        self.current = self.base;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_max() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_millis(3000));
        let delays = (0..6).map(|_| b.next_delay().as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
        assert_eq!(b.consecutive_failures(), 6);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }
}
