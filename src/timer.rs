use std::time::{Duration, Instant};

/// A non-blocking egg timer.
///
/// Nothing happens when it runs out, it is up to the owner to ask.
/// A timer set for a zero duration never runs, so is expired from the start.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
    ending: Option<Instant>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Timer {
    /// Start a timer running for `duration`.
    pub fn new(duration: Duration) -> Self {
        let started = Instant::now();
        let ending = (!duration.is_zero()).then(|| started + duration);

        Self { started, ending }
    }

    /// Start over, running for `duration` from now.
    pub fn reset(&mut self, duration: Duration) {
        *self = Self::new(duration);
    }

    /// True once the duration has passed.
    pub fn expired(&self) -> bool {
        self.ending.map_or(true, |ending| Instant::now() >= ending)
    }

    /// Time left until expiry, zero if already expired.
    pub fn remaining(&self) -> Duration {
        self.ending.map_or(Duration::ZERO, |ending| {
            ending.saturating_duration_since(Instant::now())
        })
    }

    /// Time since the timer was (re)started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// When the timer expires, if it is still running.
    pub fn deadline(&self) -> Option<Instant> {
        self.ending.filter(|ending| *ending > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn zero_duration_is_expired() {
        let timer = Timer::new(Duration::ZERO);

        assert!(timer.expired());
        assert_eq!(timer.remaining(), Duration::ZERO);
        assert!(timer.deadline().is_none());
        assert!(Timer::default().expired());
    }

    #[test]
    fn runs_out() {
        let mut timer = Timer::new(Duration::from_millis(20));

        assert!(!timer.expired());
        assert!(timer.remaining() > Duration::ZERO);
        assert!(timer.deadline().is_some());

        thread::sleep(Duration::from_millis(30));

        assert!(timer.expired());
        assert_eq!(timer.remaining(), Duration::ZERO);
        assert!(timer.elapsed() >= Duration::from_millis(30));

        timer.reset(Duration::from_secs(60));
        assert!(!timer.expired());
        assert!(timer.elapsed() < Duration::from_secs(1));
    }
}
