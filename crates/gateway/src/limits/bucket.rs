//! In-memory token-bucket rate limiter with a bounded bucket table.
//!
//! One mutex covers the table and every per-entry field. Table growth
//! is kept in check three ways: lazy TTL cleanup on an interval, a
//! full cleanup when the table is at capacity, and as a last resort an
//! insertion-order batch eviction. When the table still has no room,
//! new keys are denied without allocating.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Suggested wait in seconds when denied.
    pub retry_after: f64,
    pub remaining: f64,
}

impl Decision {
    fn allowed(remaining: f64) -> Self {
        Self {
            allowed: true,
            retry_after: 0.0,
            remaining,
        }
    }

    fn denied(retry_after: f64, remaining: f64) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining,
        }
    }

    /// Retry-after as whole seconds for the `Retry-After` header.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.max(0.0).ceil() as u64
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct Table {
    buckets: HashMap<String, Bucket>,
    /// Insertion order for eviction; may contain keys the TTL cleanup
    /// already dropped (skipped when popped).
    insertion: VecDeque<String>,
    last_cleanup: Instant,
}

pub struct TokenBucketLimiter {
    ttl: Duration,
    cleanup_interval: Duration,
    max_buckets: usize,
    evict_batch: usize,
    table: Mutex<Table>,
}

impl TokenBucketLimiter {
    pub fn new(ttl: Duration, cleanup_interval: Duration, max_buckets: usize, evict_batch: usize) -> Self {
        Self {
            ttl,
            cleanup_interval,
            max_buckets: max_buckets.max(1),
            evict_batch: evict_batch.max(1),
            table: Mutex::new(Table {
                buckets: HashMap::new(),
                insertion: VecDeque::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            Duration::from_secs(900),
            Duration::from_secs(60),
            100_000,
            2000,
        )
    }

    /// Check and consume `cost` tokens from `key`'s bucket.
    pub fn allow(&self, key: &str, capacity: f64, refill_rate: f64, cost: f64) -> Decision {
        self.allow_at(key, capacity, refill_rate, cost, Instant::now())
    }

    /// Clock-injectable variant backing [`Self::allow`].
    pub fn allow_at(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now: Instant,
    ) -> Decision {
        let capacity = capacity.max(0.0);
        let refill_rate = refill_rate.max(0.0);
        let cost = cost.max(0.0);

        let mut table = self.table.lock();

        if !table.buckets.contains_key(key) {
            // Periodic cleanup first, then pressure responses.
            if now.duration_since(table.last_cleanup) > self.cleanup_interval {
                self.cleanup_locked(&mut table, now);
                table.last_cleanup = now;
            }
            if table.buckets.len() >= self.max_buckets {
                self.cleanup_locked(&mut table, now);
            }
            if table.buckets.len() >= self.max_buckets {
                self.evict_locked(&mut table);
            }
            if table.buckets.len() >= self.max_buckets {
                // Refuse to allocate; the client retries shortly.
                return Decision::denied(1.0, 0.0);
            }
            table.buckets.insert(
                key.to_string(),
                Bucket {
                    tokens: capacity,
                    last_refill: now,
                    last_seen: now,
                },
            );
            table.insertion.push_back(key.to_string());
        }

        let ttl_secs = self.ttl.as_secs_f64();
        let bucket = table.buckets.get_mut(key).expect("bucket just ensured");
        bucket.last_seen = now;

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if refill_rate > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity);
        } else {
            bucket.tokens = bucket.tokens.min(capacity);
        }
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Decision::allowed(bucket.tokens.max(0.0));
        }

        let retry_after = if refill_rate <= 0.0 {
            ttl_secs
        } else {
            (cost - bucket.tokens) / refill_rate
        };
        Decision::denied(retry_after, bucket.tokens.max(0.0))
    }

    /// Number of live buckets (monitoring).
    pub fn len(&self) -> usize {
        self.table.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().buckets.is_empty()
    }

    // ── Private ──────────────────────────────────────────────────────

    fn cleanup_locked(&self, table: &mut Table, now: Instant) {
        let ttl = self.ttl;
        table
            .buckets
            .retain(|_, b| now.saturating_duration_since(b.last_seen) <= ttl);
    }

    /// Drop the oldest-inserted buckets, no sorting. Queue entries for
    /// already-cleaned keys are skipped.
    fn evict_locked(&self, table: &mut Table) {
        let mut evicted = 0;
        while evicted < self.evict_batch {
            let Some(key) = table.insertion.pop_front() else {
                break;
            };
            if table.buckets.remove(&key).is_some() {
                evicted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> TokenBucketLimiter {
        TokenBucketLimiter::with_defaults()
    }

    #[test]
    fn burst_then_denied_with_retry_after() {
        let l = limiter();
        let now = Instant::now();

        // capacity=3, 60 rpm → 1 token/sec.
        for _ in 0..3 {
            let d = l.allow_at("k", 3.0, 1.0, 1.0, now);
            assert!(d.allowed);
        }
        let d = l.allow_at("k", 3.0, 1.0, 1.0, now);
        assert!(!d.allowed);
        assert!((d.retry_after - 1.0).abs() < 0.1, "retry_after = {}", d.retry_after);
    }

    #[test]
    fn tokens_refill_over_time() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..2 {
            assert!(l.allow_at("k", 2.0, 1.0, 1.0, t0).allowed);
        }
        assert!(!l.allow_at("k", 2.0, 1.0, 1.0, t0).allowed);

        let t1 = t0 + Duration::from_millis(1500);
        let d = l.allow_at("k", 2.0, 1.0, 1.0, t1);
        assert!(d.allowed);
        // 1.5 refilled, 1 spent.
        assert!((d.remaining - 0.5).abs() < 1e-9);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let l = limiter();
        let t0 = Instant::now();
        assert!(l.allow_at("k", 3.0, 10.0, 1.0, t0).allowed);

        let t1 = t0 + Duration::from_secs(3600);
        let d = l.allow_at("k", 3.0, 10.0, 1.0, t1);
        assert!(d.allowed);
        assert!((d.remaining - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_refill_rate_reports_ttl_as_retry_after() {
        let l = limiter();
        let now = Instant::now();
        assert!(l.allow_at("k", 1.0, 0.0, 1.0, now).allowed);
        let d = l.allow_at("k", 1.0, 0.0, 1.0, now);
        assert!(!d.allowed);
        assert_eq!(d.retry_after, 900.0);
    }

    #[test]
    fn dynamic_cost_consumes_multiple_tokens() {
        let l = limiter();
        let now = Instant::now();
        let d = l.allow_at("k", 10.0, 1.0, 4.0, now);
        assert!(d.allowed);
        assert!((d.remaining - 6.0).abs() < 1e-9);

        let d = l.allow_at("k", 10.0, 1.0, 7.0, now);
        assert!(!d.allowed);
        // Needs 1 more token at 1/sec.
        assert!((d.retry_after - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ttl_cleanup_drops_idle_buckets() {
        let l = TokenBucketLimiter::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
            100,
            10,
        );
        let t0 = Instant::now();
        l.allow_at("idle", 5.0, 1.0, 1.0, t0);
        assert_eq!(l.len(), 1);

        // A new key past the cleanup interval triggers the sweep.
        let t1 = t0 + Duration::from_secs(20);
        l.allow_at("fresh", 5.0, 1.0, 1.0, t1);
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn full_table_evicts_in_insertion_order() {
        let l = TokenBucketLimiter::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            3,
            2,
        );
        let now = Instant::now();
        l.allow_at("a", 1.0, 1.0, 1.0, now);
        l.allow_at("b", 1.0, 1.0, 1.0, now);
        l.allow_at("c", 1.0, 1.0, 1.0, now);
        assert_eq!(l.len(), 3);

        // Table full and nothing idle: the two oldest get evicted.
        let d = l.allow_at("d", 1.0, 1.0, 1.0, now);
        assert!(d.allowed);
        assert_eq!(l.len(), 2); // c and d survive

        // "a" was evicted, so it gets a brand-new full bucket.
        let d = l.allow_at("a", 1.0, 1.0, 1.0, now);
        assert!(d.allowed);
    }

    #[test]
    fn eviction_frees_exactly_enough_room_under_pressure() {
        let l = TokenBucketLimiter::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            2,
            1,
        );
        let now = Instant::now();
        l.allow_at("a", 1.0, 1.0, 1.0, now);
        l.allow_at("b", 1.0, 1.0, 1.0, now);

        // Eviction frees one slot; this insert refills the table.
        assert!(l.allow_at("c", 1.0, 1.0, 1.0, now).allowed);
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn bucket_monotonicity_between_allowances() {
        // Between two allowed calls with cost 1, the remaining-token
        // delta lies in [-1, rate * elapsed].
        let l = limiter();
        let t0 = Instant::now();
        let d0 = l.allow_at("k", 5.0, 2.0, 1.0, t0);
        let elapsed = 0.4;
        let t1 = t0 + Duration::from_millis(400);
        let d1 = l.allow_at("k", 5.0, 2.0, 1.0, t1);
        assert!(d0.allowed && d1.allowed);

        let delta = d1.remaining - d0.remaining;
        assert!(delta >= -1.0 - 1e-9);
        assert!(delta <= 2.0 * elapsed + 1e-9);
    }

    #[test]
    fn retry_after_secs_rounds_up() {
        let d = Decision::denied(0.2, 0.0);
        assert_eq!(d.retry_after_secs(), 1);
        let d = Decision::denied(2.0, 0.0);
        assert_eq!(d.retry_after_secs(), 2);
    }
}
