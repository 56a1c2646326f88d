//! Timestamps and registration lifetimes
//!
//! Write timestamps are wall-clock nanoseconds forced to be strictly
//! increasing within a process. Comparison across nodes uses the raw
//! values, so clock skew between nodes is not compensated.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static LAST_MODIFIED: AtomicI64 = AtomicI64::new(0);

/// Current wall-clock time in nanoseconds since the unix epoch
pub fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Next write timestamp: `max(wall_nanos(), last + 1)`
pub fn next_modified() -> i64 {
    let wall = wall_nanos();
    let mut last = LAST_MODIFIED.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last.saturating_add(1));
        match LAST_MODIFIED.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Registration lifetime in nanoseconds.
///
/// Zero never expires; a negative value yields a deadline that has
/// already lapsed when the registration is applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ttl(i64);

impl Ttl {
    pub const NEVER: Ttl = Ttl(0);

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// A lifetime that ended `ago` before the registration
    pub fn lapsed(ago: Duration) -> Self {
        Self(-duration_nanos(ago))
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn is_never(&self) -> bool {
        self.0 == 0
    }

    /// Absolute deadline for a registration written at `now`, 0 = never
    pub fn deadline(&self, now: i64) -> i64 {
        if self.is_never() {
            0
        } else {
            now.saturating_add(self.0)
        }
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Self(duration_nanos(d))
    }
}

impl From<Option<Duration>> for Ttl {
    fn from(d: Option<Duration>) -> Self {
        d.map(Ttl::from).unwrap_or(Ttl::NEVER)
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
