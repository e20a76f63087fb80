//! Injectable time source.
//!
//! Every time-sensitive decision (expiry, poll pacing, rate windows) reads
//! unix seconds through a [`Clock`] so tests can drive the state machine on
//! virtual time instead of sleeping.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct Clock {
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Clock {
    /// Wall-clock seconds since the unix epoch.
    pub fn system_utc() -> Self {
        Self {
            now_fn: Arc::new(|| chrono::Utc::now().timestamp()),
        }
    }

    /// A clock that only moves when the returned handle is advanced.
    pub fn manual(start: i64) -> (Self, ManualClock) {
        let instant = Arc::new(AtomicI64::new(start));
        let handle = ManualClock {
            instant: instant.clone(),
        };
        let clock = Self {
            now_fn: Arc::new(move || instant.load(Ordering::SeqCst)),
        };
        (clock, handle)
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

/// Handle that moves a manual [`Clock`] forward.
#[derive(Clone)]
pub struct ManualClock {
    instant: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn advance(&self, secs: i64) {
        self.instant.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, instant: i64) {
        self.instant.store(instant, Ordering::SeqCst);
    }
}
