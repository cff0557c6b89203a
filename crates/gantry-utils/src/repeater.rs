use std::time::{Duration, Instant};

/// Fires at most once per interval, checked from the owning loop.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        let due = self.last_acted.is_none_or(|t| t.elapsed() >= self.interval);
        if due {
            self.last_acted = Some(Instant::now());
        }
        due
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_immediately_then_waits() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        assert!(r.fired());
        assert!(!r.fired());
        r.force_fire();
        assert!(r.fired());
    }

    #[test]
    fn reset_postpones_next_fire() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        r.reset();
        assert!(!r.fired());
    }
}
