//! Delta synchronization of device-side stores (SMS, call log, ...).
//!
//! A [`ChangeFeed`] exposes "everything newer than a mark"; the
//! [`DedupeWindow`] makes redelivery harmless when a source returns
//! overlapping results around the mark.

pub mod delta;

use async_trait::async_trait;

use std::collections::HashSet;

pub use delta::DeltaSyncer;

/// A record with a source-side ordering timestamp (unix millis).
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

/// A queryable source of timestamped records.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    type Item: Timestamped + Send;

    /// Records with `timestamp() >= mark`, oldest first. Inclusive on
    /// purpose: sources with second-granularity clocks can return rows at
    /// the mark again, which the dedupe window absorbs.
    async fn fetch_since(&self, mark: i64) -> Vec<Self::Item>;
}

/// Session-scoped duplicate suppression around the high-water mark.
#[derive(Default)]
pub struct DedupeWindow {
    seen: HashSet<i64>,
    high_water: i64,
}

impl DedupeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a record's timestamp. Returns `false` for a timestamp seen
    /// before in this session.
    pub fn admit(&mut self, ts: i64) -> bool {
        if !self.seen.insert(ts) {
            return false;
        }
        if ts > self.high_water {
            self.high_water = ts;
        }
        true
    }

    /// Whether a timestamp was already admitted this session, without
    /// admitting it.
    pub fn is_seen(&self, ts: i64) -> bool {
        self.seen.contains(&ts)
    }

    /// The fetch mark for the next cycle.
    pub fn mark(&self) -> i64 {
        self.high_water
    }
}
