//! Time source abstraction so expiry and completion timestamps are testable.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Manually driven clock for tests.
    #[derive(Debug)]
    pub struct MockClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl MockClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        pub fn set(&self, at: DateTime<Utc>) {
            *self.now.lock() = at;
        }

        pub fn advance(&self, by: chrono::Duration) {
            let mut now = self.now.lock();
            *now += by;
        }
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new(Utc::now())
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
