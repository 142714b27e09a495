//! Liveness-write throttle.
//!
//! Every inbound frame proves a session is alive, but writing a timestamp
//! per frame would hammer the store. Each connection owns one throttle and
//! persists at most one liveness write per interval. The throttle has no
//! say in what the registry considers live — that follows socket
//! open/close only.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct HeartbeatThrottle {
    interval: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl HeartbeatThrottle {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_write: Mutex::new(None),
        }
    }

    /// Whether a durable liveness write is due. Claims the slot when it
    /// returns `true`, so exactly one caller per interval persists.
    pub fn should_persist(&self) -> bool {
        let mut last = self.last_write.lock();
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for HeartbeatThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_persists() {
        let throttle = HeartbeatThrottle::default();
        assert!(throttle.should_persist());
    }

    #[test]
    fn writes_within_interval_are_suppressed() {
        let throttle = HeartbeatThrottle::new(Duration::from_secs(30));
        assert!(throttle.should_persist());
        for _ in 0..10 {
            assert!(!throttle.should_persist());
        }
    }

    #[test]
    fn write_allowed_again_after_interval() {
        let throttle = HeartbeatThrottle::new(Duration::from_millis(10));
        assert!(throttle.should_persist());
        assert!(!throttle.should_persist());
        std::thread::sleep(Duration::from_millis(15));
        assert!(throttle.should_persist());
    }

    #[test]
    fn throttles_are_independent_per_connection() {
        let a = HeartbeatThrottle::new(Duration::from_secs(30));
        let b = HeartbeatThrottle::new(Duration::from_secs(30));
        assert!(a.should_persist());
        // A second connection's first frame still persists
        assert!(b.should_persist());
    }
}
