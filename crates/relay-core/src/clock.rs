use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

/// Current logical time in seconds since the Unix epoch.
///
/// Follows the wall clock at microsecond resolution but never repeats or goes
/// backwards within the process, so it can be used as an ordering key for events.
pub fn now() -> f64 {
    let wall = Utc::now().timestamp_micros();
    let mut prev = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_MICROS.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next as f64 / 1_000_000.0,
            Err(actual) => prev = actual,
        }
    }
}
