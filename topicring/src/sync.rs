#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{fence, AtomicU64, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam::utils::Backoff;

#[cfg(not(feature = "loom"))]
#[inline]
pub(crate) fn snooze(backoff: &Backoff) {
    backoff.snooze();
}

#[cfg(feature = "loom")]
pub(crate) fn snooze(_backoff: &Backoff) {
    loom::thread::yield_now();
}
