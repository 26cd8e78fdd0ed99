//! Token bucket Rate Limiter (spec §4.7).
//!
//! One bucket per API key, held in a sharded concurrent map (`flurry`, the
//! same structure the teacher reaches for wherever it needs a map of
//! per-entry locks rather than one coarse lock over everything — see
//! `hbone::pool`'s `established_conn_writelock`). Each bucket refills lazily
//! on access rather than via a ticking background task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Allow { remaining: u64 },
	Deny { retry_after_seconds: u64 },
}

struct Bucket {
	capacity: u64,
	refill_rate_per_sec: f64,
	tokens: f64,
	last_refill: Instant,
	last_used: Instant,
}

impl Bucket {
	fn new(capacity: u64, window: Duration) -> Self {
		let now = Instant::now();
		Bucket {
			capacity,
			refill_rate_per_sec: capacity as f64 / window.as_secs_f64().max(f64::EPSILON),
			tokens: capacity as f64,
			last_refill: now,
			last_used: now,
		}
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.capacity as f64);
		self.last_refill = now;
	}

	fn consume(&mut self, n: u64) -> Decision {
		let now = Instant::now();
		self.refill(now);
		self.last_used = now;
		if self.tokens >= n as f64 {
			self.tokens -= n as f64;
			Decision::Allow {
				remaining: self.tokens.floor() as u64,
			}
		} else {
			let deficit = n as f64 - self.tokens;
			let retry_after = (deficit / self.refill_rate_per_sec).ceil().max(0.0) as u64;
			Decision::Deny {
				retry_after_seconds: retry_after,
			}
		}
	}

	fn idle_for(&self, now: Instant) -> Duration {
		now.duration_since(self.last_used)
	}
}

/// Per-key token buckets. `capacity`/`window` are the process-wide defaults;
/// individual keys may override both via `ApiKey::rate_limit`.
pub struct RateLimiter {
	buckets: flurry::HashMap<String, Arc<Mutex<Bucket>>>,
	default_capacity: u64,
	default_window: Duration,
	bucket_ttl: Duration,
}

impl RateLimiter {
	pub fn new(default_capacity: u64, default_window: Duration, bucket_ttl: Duration) -> Self {
		RateLimiter {
			buckets: flurry::HashMap::new(),
			default_capacity,
			default_window,
			bucket_ttl,
		}
	}

	/// Consumes `n` tokens from `key`'s bucket, creating it with
	/// `capacity`/`window` (falling back to the process default) if this is
	/// the first time the key has been seen.
	pub fn consume(&self, key: &str, capacity: Option<u64>, window_seconds: Option<u64>, n: u64) -> Decision {
		let capacity = capacity.unwrap_or(self.default_capacity);
		let window = window_seconds.map(Duration::from_secs).unwrap_or(self.default_window);

		let guard = self.buckets.guard();
		if let Some(bucket) = self.buckets.get(key, &guard) {
			return bucket.lock().consume(n);
		}

		let bucket = Arc::new(Mutex::new(Bucket::new(capacity, window)));
		let decision = bucket.lock().consume(n);
		// Another task may have raced us to insert; either outcome is a
		// correctly-initialized bucket so we don't need to retry.
		self.buckets.try_insert(key.to_string(), bucket, &guard).ok();
		decision
	}

	/// Drops buckets idle longer than the configured TTL. Safe to call
	/// periodically from a background task; eviction never loses state that
	/// matters because a future request just repopulates a full bucket.
	pub fn evict_idle(&self) {
		let now = Instant::now();
		let guard = self.buckets.guard();
		let stale: Vec<String> = self
			.buckets
			.iter(&guard)
			.filter(|(_, bucket)| bucket.lock().idle_for(now) > self.bucket_ttl)
			.map(|(key, _)| key.clone())
			.collect();
		for key in stale {
			self.buckets.remove(&key, &guard);
		}
	}

	#[cfg(test)]
	fn bucket_count(&self) -> usize {
		let guard = self.buckets.guard();
		self.buckets.iter(&guard).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allows_up_to_capacity() {
		let limiter = RateLimiter::new(2, Duration::from_secs(60), Duration::from_secs(3600));
		assert!(matches!(limiter.consume("k", None, None, 1), Decision::Allow { .. }));
		assert!(matches!(limiter.consume("k", None, None, 1), Decision::Allow { .. }));
		assert!(matches!(limiter.consume("k", None, None, 1), Decision::Deny { .. }));
	}

	#[test]
	fn per_key_override_is_independent_of_default() {
		let limiter = RateLimiter::new(1, Duration::from_secs(60), Duration::from_secs(3600));
		assert!(matches!(
			limiter.consume("k", Some(5), Some(60), 1),
			Decision::Allow { .. }
		));
		// default-capacity key is unaffected by the override used above
		assert!(matches!(limiter.consume("other", None, None, 1), Decision::Allow { .. }));
		assert!(matches!(limiter.consume("other", None, None, 1), Decision::Deny { .. }));
	}

	#[test]
	fn deny_reports_a_positive_retry_after() {
		let limiter = RateLimiter::new(1, Duration::from_secs(60), Duration::from_secs(3600));
		limiter.consume("k", None, None, 1);
		match limiter.consume("k", None, None, 1) {
			Decision::Deny { retry_after_seconds } => assert!(retry_after_seconds > 0),
			Decision::Allow { .. } => panic!("expected deny"),
		}
	}

	#[test]
	fn eviction_removes_idle_buckets_only() {
		let limiter = RateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(0));
		limiter.consume("k", None, None, 1);
		assert_eq!(limiter.bucket_count(), 1);
		limiter.evict_idle();
		assert_eq!(limiter.bucket_count(), 0);
	}
}
