use std::time::{Duration, Instant};

/// Fires at most once per interval, however long the caller stalled
/// between checks.
#[derive(Debug, Clone)]
pub struct HeartbeatTimer {
    interval: Duration,
    last: Option<Instant>,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true and re-arms if a beat is due at `now`. The first check
    /// is always due.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Time left until the next beat, for use as a poll timeout.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_check_is_due() {
        let mut timer = HeartbeatTimer::new(Duration::from_millis(200));
        assert!(timer.due(Instant::now()));
    }

    #[test]
    fn test_exactly_one_beat_per_interval() {
        let interval = Duration::from_millis(200);
        let mut timer = HeartbeatTimer::new(interval);
        let start = Instant::now();

        assert!(timer.due(start));
        assert!(!timer.due(start + Duration::from_millis(50)));
        assert!(!timer.due(start + Duration::from_millis(199)));
        assert!(timer.due(start + interval));
        assert!(!timer.due(start + interval + Duration::from_millis(1)));
    }

    #[test]
    fn test_long_stall_yields_single_beat() {
        let interval = Duration::from_millis(200);
        let mut timer = HeartbeatTimer::new(interval);
        let start = Instant::now();
        assert!(timer.due(start));

        let after_stall = start + Duration::from_secs(5);
        assert!(timer.due(after_stall));
        assert!(
            !timer.due(after_stall + Duration::from_millis(10)),
            "Missed beats are not replayed"
        );
    }

    #[test]
    fn test_remaining_counts_down() {
        let interval = Duration::from_millis(200);
        let mut timer = HeartbeatTimer::new(interval);
        let start = Instant::now();
        assert_eq!(timer.remaining(start), Duration::ZERO);

        timer.due(start);
        assert_eq!(
            timer.remaining(start + Duration::from_millis(50)),
            Duration::from_millis(150)
        );
        assert_eq!(timer.remaining(start + interval * 3), Duration::ZERO);
    }
}
