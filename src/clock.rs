//! Capture-time clock shared by every signal source.
//!
//! Timestamps are nanoseconds since the Unix epoch, but they advance with a
//! monotonic `Instant` measured from a single anchor taken on first use. Wall
//! clock adjustments (NTP steps, GPS time sync) therefore never make a source's
//! timestamps go backwards.

use chrono::Utc;
use once_cell::sync::Lazy;
use std::time::Instant;

struct Anchor {
    instant: Instant,
    epoch_ns: u64,
}

static ANCHOR: Lazy<Anchor> = Lazy::new(|| Anchor {
    instant: Instant::now(),
    epoch_ns: Utc::now()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(0),
});

/// Current capture timestamp in nanoseconds.
pub fn now_ns() -> u64 {
    let anchor = &*ANCHOR;
    let elapsed = u64::try_from(anchor.instant.elapsed().as_nanos()).unwrap_or(u64::MAX);
    anchor.epoch_ns.saturating_add(elapsed)
}
