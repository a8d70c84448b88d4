use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Duration;

/// One armed election deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub generation: u64,
    pub duration: Duration,
}

/// Randomized election timeout with generation tracking.
///
/// Every `rearm` or `disarm` starts a new generation; a sleeping timer may
/// only act if its generation is still current, and `fire` lets exactly one
/// caller claim a generation.
#[derive(Debug)]
pub struct ElectionTimer {
    timeout_range: (u64, u64),
    generation: AtomicU64,
}

impl ElectionTimer {
    /// @param: timeout_range: (min_ms, max_ms), max exclusive
    pub fn new(timeout_range: (u64, u64)) -> Self {
        Self {
            timeout_range,
            generation: AtomicU64::new(0),
        }
    }

    pub fn random_duration(&self) -> Duration {
        let (min, max) = self.timeout_range;
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(min..max.max(min + 1)))
    }

    /// Invalidates every earlier deadline and hands out a fresh one.
    pub fn rearm(&self) -> Deadline {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Deadline {
            generation,
            duration: self.random_duration(),
        }
    }

    /// Invalidates every outstanding deadline without arming a new one.
    pub fn disarm(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Claims `generation`. True at most once, and only while it is current.
    pub fn fire(&self, generation: u64) -> bool {
        self.generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_within_range() {
        let timer = ElectionTimer::new((150, 300));
        for _ in 0..100 {
            let d = timer.random_duration();
            assert!(d >= Duration::from_millis(150) && d < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_fires_once_per_generation() {
        let timer = ElectionTimer::new((10, 20));
        let deadline = timer.rearm();

        assert!(timer.fire(deadline.generation));
        assert!(!timer.fire(deadline.generation));
    }

    #[test]
    fn test_rearm_makes_old_deadline_inert() {
        let timer = ElectionTimer::new((10, 20));
        let stale = timer.rearm();
        let fresh = timer.rearm();

        assert!(!timer.fire(stale.generation));
        assert!(timer.fire(fresh.generation));
    }

    #[test]
    fn test_disarm_cancels_pending_deadline() {
        let timer = ElectionTimer::new((10, 20));
        let deadline = timer.rearm();
        timer.disarm();

        assert!(!timer.fire(deadline.generation));
        assert!(timer.current_generation() > deadline.generation);
    }
}
