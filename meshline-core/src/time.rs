//! Time service (spec.md §6.4): a monotone, server-correctable millisecond
//! clock used for envelope freshness checks and the `Connection`'s `openedAt`
//! stamp. Abstracted behind a trait so tests can control time deterministically
//! instead of racing real deadlines (the saga's default step deadline is 60s).

use std::sync::atomic::{AtomicI64, Ordering};

/// A source of the current time, in milliseconds since an arbitrary epoch.
/// Implementations need not agree on the epoch with each other; only with
/// themselves, consistently, for the lifetime of a process.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time via `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as i64
    }
}

/// A manually-advanced clock for deterministic tests (complements
/// `tokio::time::pause`/`advance` for the saga's own timer, since envelope
/// freshness checks are a plain value comparison rather than a sleep).
#[derive(Debug)]
pub struct MockClock {
    millis: AtomicI64,
}

impl MockClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_millis(&self, value: i64) {
        self.millis.store(value, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
