//! Coarse-grained idle-eviction timer. Connections are bucketed by the
//! two-second granularity the original core used (`kUnitGrand`) rather than
//! tracked with one timer per connection, so refreshing a connection's
//! deadline on every read/write stays cheap even with tens of thousands of
//! connections open.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const GRANULARITY: Duration = Duration::from_secs(2);

/// `(bucket, connection id)` ordered map of pending idle deadlines.
///
/// The original C++ core keyed this by `(unit, ctx)` where `ctx` was a raw
/// pointer cast to `long`, and its `operator<` compared the two fields with
/// `&&` instead of a lexicographic fallback — not a strict weak ordering, so
/// `std::map` could silently drop or misplace entries whose buckets differed
/// but whose pointers happened to compare unluckily. Keying by the
/// connection's small integer id instead of its address sidesteps the bug
/// entirely: a `(i64, u64)` tuple has a perfectly well-defined total order,
/// there is no "equivalent but distinct" pair to mis-rank.
pub struct TimeWheel {
    idle_timeout: Duration,
    epoch: Instant,
    deadlines: BTreeMap<(i64, u64), ()>,
    by_id: HashMap<u64, i64>,
}

impl TimeWheel {
    pub fn new(idle_timeout: Duration) -> TimeWheel {
        TimeWheel {
            idle_timeout,
            epoch: Instant::now(),
            deadlines: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    fn now_bucket(&self) -> i64 {
        let elapsed = self.epoch.elapsed();
        (elapsed.as_secs_f64() / GRANULARITY.as_secs_f64()) as i64
    }

    fn bucket_for(&self, from: i64) -> i64 {
        let buckets = (self.idle_timeout.as_secs_f64() / GRANULARITY.as_secs_f64()).ceil() as i64;
        from + buckets.max(1)
    }

    /// (Re)schedule `id` to expire one `idle_timeout` from now, cancelling
    /// any previously pending deadline for it first.
    pub fn schedule(&mut self, id: u64) {
        self.cancel(id);
        let bucket = self.bucket_for(self.now_bucket());
        self.deadlines.insert((bucket, id), ());
        self.by_id.insert(id, bucket);
    }

    pub fn cancel(&mut self, id: u64) {
        if let Some(bucket) = self.by_id.remove(&id) {
            self.deadlines.remove(&(bucket, id));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Remove and return every connection id whose bucket is `<=` the
    /// current bucket.
    ///
    /// The original core carried two inconsistent implementations of this
    /// scan: `core/timer.cc` breaks out of the loop once `unit > current`
    /// (correct: every remaining key is also `> current`, since the map is
    /// ordered), while the copy embedded in `core/pipeline.cc` breaks on
    /// `unit < current` instead, which stops at the very first live bucket
    /// and leaves every later-but-still-expired bucket sitting in the map.
    /// This follows `timer.cc`'s variant.
    pub fn expire_due(&mut self) -> Vec<u64> {
        let now = self.now_bucket();
        let mut expired = Vec::new();

        loop {
            let key = match self.deadlines.keys().next().copied() {
                Some(key) if key.0 <= now => key,
                _ => break,
            };

            self.deadlines.remove(&key);
            self.by_id.remove(&key.1);
            expired.push(key.1);
        }

        expired
    }

    /// How long the caller's poll should block for, given its own requested
    /// timeout and the next pending deadline (whichever is sooner).
    pub fn next_deadline(&self, requested: Option<Duration>) -> Option<Duration> {
        let next_bucket = self.deadlines.keys().next().map(|&(bucket, _)| bucket);

        let wheel_timeout = next_bucket.map(|bucket| {
            let now = self.now_bucket();
            let buckets_left = (bucket - now).max(0) as u64;
            Duration::from_secs(buckets_left * GRANULARITY.as_secs()).max(Duration::from_millis(1))
        });

        match (requested, wheel_timeout) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (Some(r), None) => Some(r),
            (None, w) => w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_then_cancel_leaves_nothing_pending() {
        let mut wheel = TimeWheel::new(Duration::from_secs(2));
        wheel.schedule(1);
        assert!(!wheel.is_empty());
        wheel.cancel(1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn rescheduling_replaces_the_previous_deadline() {
        let mut wheel = TimeWheel::new(Duration::from_secs(2));
        wheel.schedule(7);
        wheel.schedule(7);
        assert_eq!(wheel.deadlines.len(), 1);
    }

    #[test]
    fn expire_due_only_returns_buckets_at_or_before_now() {
        let mut wheel = TimeWheel::new(Duration::from_secs(2));
        // Manually inject a far-future bucket so it must not be returned.
        wheel.deadlines.insert((i64::MAX, 99), ());
        wheel.by_id.insert(99, i64::MAX);
        assert!(wheel.expire_due().is_empty());
    }
}
