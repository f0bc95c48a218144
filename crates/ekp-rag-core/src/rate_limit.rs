//! Per-caller rate limiting.
//!
//! Two independent algorithms, both scoped per `(identifier, action)` and
//! each evaluated as one atomic [`Script`] so concurrent callers on the
//! same key cannot interleave a read with a write:
//!
//! - [`RateLimiter`]: fixed-window counter at
//!   `{prefix}:rate_limit:{action}:{identifier}`. The first request opens
//!   the window; the window resets only when its key expires.
//! - [`TokenBucket`]: lazily refilled bucket at
//!   `{prefix}:token_bucket:{action}:{identifier}`. Buckets untouched for
//!   an hour expire and start full again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::error::RagError;
use crate::kv::{Clock, KvStore, Script};

/// Idle expiry of token-bucket state.
pub const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: format!("{}:rate_limit", prefix),
        }
    }

    fn key(&self, identifier: &str, action: &str) -> String {
        format!("{}:{}:{}", self.prefix, action, identifier)
    }

    /// Count one request and report whether it is within `max_requests`
    /// for the current window.
    pub async fn is_allowed(
        &self,
        identifier: &str,
        action: &str,
        max_requests: u64,
        window: Duration,
    ) -> Result<bool> {
        if window.is_zero() {
            return Err(RagError::InvalidParameter("rate limit window must be > 0".into()).into());
        }
        let allowed = self
            .kv
            .eval(&Script::FixedWindow {
                key: self.key(identifier, action),
                max_requests,
                window,
            })
            .await?
            == 1;
        if !allowed {
            debug!(identifier, action, max_requests, "rate limited");
        }
        Ok(allowed)
    }

    /// Requests left in the current window.
    pub async fn remaining(&self, identifier: &str, action: &str, max_requests: u64) -> Result<u64> {
        let used: u64 = self
            .kv
            .get(&self.key(identifier, action))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(max_requests.saturating_sub(used))
    }

    /// Close the current window early. Returns whether one was open.
    pub async fn reset(&self, identifier: &str, action: &str) -> Result<bool> {
        Ok(self.kv.delete(&[self.key(identifier, action)]).await? > 0)
    }
}

pub struct TokenBucket {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl TokenBucket {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, prefix: &str) -> Self {
        Self {
            kv,
            clock,
            prefix: format!("{}:token_bucket", prefix),
        }
    }

    fn key(&self, identifier: &str, action: &str) -> String {
        format!("{}:{}:{}", self.prefix, action, identifier)
    }

    fn validate(capacity: f64, refill_rate: f64) -> Result<(), RagError> {
        if !(capacity > 0.0) {
            return Err(RagError::InvalidParameter(format!(
                "bucket capacity must be > 0, got {}",
                capacity
            )));
        }
        if !(refill_rate >= 0.0) {
            return Err(RagError::InvalidParameter(format!(
                "refill rate must be >= 0, got {}",
                refill_rate
            )));
        }
        Ok(())
    }

    /// Take `tokens` from the bucket if the refilled level allows it.
    /// The level is `min(capacity, stored + elapsed × refill_rate)`; a
    /// rejected request leaves the stored state untouched.
    pub async fn consume(
        &self,
        identifier: &str,
        action: &str,
        capacity: f64,
        refill_rate: f64,
        tokens: f64,
    ) -> Result<bool> {
        Self::validate(capacity, refill_rate)?;
        if !(tokens > 0.0) {
            return Err(RagError::InvalidParameter(format!(
                "requested tokens must be > 0, got {}",
                tokens
            ))
            .into());
        }
        let admitted = self
            .kv
            .eval(&Script::TokenBucket {
                key: self.key(identifier, action),
                capacity,
                refill_rate,
                requested: tokens,
                now_us: self.clock.unix_micros(),
                idle_ttl: BUCKET_IDLE_TTL,
            })
            .await?
            == 1;
        if !admitted {
            debug!(identifier, action, tokens, "token bucket empty");
        }
        Ok(admitted)
    }

    /// Current level after lazy refill, without consuming anything.
    pub async fn tokens(
        &self,
        identifier: &str,
        action: &str,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<f64> {
        Self::validate(capacity, refill_rate)?;
        let fields = self
            .kv
            .hmget(&self.key(identifier, action), &["tokens", "last_refill"])
            .await?;
        let parse = |i: usize| {
            fields
                .get(i)
                .and_then(|v| v.as_deref())
        };
        let stored = parse(0).and_then(|v| v.parse::<f64>().ok());
        let last_refill = parse(1).and_then(|v| v.parse::<i64>().ok());
        let (Some(stored), Some(last_refill)) = (stored, last_refill) else {
            return Ok(capacity);
        };
        let elapsed_us = self.clock.unix_micros().saturating_sub(last_refill).max(0);
        Ok(capacity.min(stored + elapsed_us as f64 * refill_rate / 1_000_000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::InMemoryKv;
    use crate::kv::ManualClock;
    use futures::future::join_all;

    fn bucket() -> (Arc<ManualClock>, TokenBucket) {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(InMemoryKv::with_clock(clock.clone()));
        (clock.clone(), TokenBucket::new(kv, clock, "ekp"))
    }

    #[tokio::test]
    async fn test_fixed_window_admits_three_then_rejects() {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(InMemoryKv::with_clock(clock.clone()));
        let limiter = RateLimiter::new(kv.clone(), "ekp");
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.is_allowed("u1", "query", 3, window).await.unwrap());
        }
        assert!(!limiter.is_allowed("u1", "query", 3, window).await.unwrap());
        assert_eq!(limiter.remaining("u1", "query", 3).await.unwrap(), 0);

        // Other identifiers and actions have their own windows.
        assert!(limiter.is_allowed("u2", "query", 3, window).await.unwrap());
        assert!(limiter.is_allowed("u1", "upload", 3, window).await.unwrap());

        clock.advance(Duration::from_secs(30));
        assert!(!limiter.is_allowed("u1", "query", 3, window).await.unwrap());
        assert_eq!(kv.ttl("ekp:rate_limit:query:u1"), Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.remaining("u1", "query", 3).await.unwrap(), 3);
        assert!(limiter.is_allowed("u1", "query", 3, window).await.unwrap());
        assert_eq!(limiter.remaining("u1", "query", 3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reset_and_zero_limit() {
        let kv = Arc::new(InMemoryKv::new());
        let limiter = RateLimiter::new(kv, "ekp");
        let window = Duration::from_secs(60);

        assert!(limiter.is_allowed("u1", "query", 1, window).await.unwrap());
        assert!(!limiter.is_allowed("u1", "query", 1, window).await.unwrap());
        assert!(limiter.reset("u1", "query").await.unwrap());
        assert!(!limiter.reset("u1", "query").await.unwrap());
        assert!(limiter.is_allowed("u1", "query", 1, window).await.unwrap());

        assert!(!limiter.is_allowed("u3", "query", 0, window).await.unwrap());
        assert!(limiter
            .is_allowed("u1", "query", 1, Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fixed_window_concurrent_callers() {
        let kv = Arc::new(InMemoryKv::new());
        let limiter = Arc::new(RateLimiter::new(kv, "ekp"));
        let tasks = (0..25).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .is_allowed("u1", "query", 10, Duration::from_secs(60))
                    .await
                    .unwrap()
            })
        });
        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_bucket_drains_then_refills_one() {
        let (clock, bucket) = bucket();
        let (capacity, rate) = (3.0, 2.0);

        for _ in 0..3 {
            assert!(bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());
        }
        assert!(!bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());

        clock.advance(Duration::from_millis(500));
        assert!(bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());
        assert!(!bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_bucket_refills_one_token_per_interval_at_any_rate() {
        for rate in [3.0, 7.0, 10.0, 0.3, 1.0 / 3.0] {
            let (clock, bucket) = bucket();
            let capacity = 3.0;
            for _ in 0..3 {
                assert!(bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());
            }
            assert!(!bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());

            clock.advance(Duration::from_secs_f64(1.0 / rate));
            assert!(
                bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap(),
                "rate {} did not refill after 1/rate seconds",
                rate
            );
            assert!(!bucket.consume("u1", "embed", capacity, rate, 1.0).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_bucket_level_capped_at_capacity() {
        let (clock, bucket) = bucket();
        assert_eq!(bucket.tokens("u1", "embed", 5.0, 1.0).await.unwrap(), 5.0);
        assert!(bucket.consume("u1", "embed", 5.0, 1.0, 2.0).await.unwrap());
        assert_eq!(bucket.tokens("u1", "embed", 5.0, 1.0).await.unwrap(), 3.0);

        clock.advance(Duration::from_secs(1000));
        assert_eq!(bucket.tokens("u1", "embed", 5.0, 1.0).await.unwrap(), 5.0);
        assert!(bucket.consume("u1", "embed", 5.0, 1.0, 5.0).await.unwrap());
        assert!(!bucket.consume("u1", "embed", 5.0, 1.0, 0.5).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_request_leaves_state_untouched() {
        let (clock, bucket) = bucket();
        assert!(bucket.consume("u1", "embed", 4.0, 1.0, 3.0).await.unwrap());
        clock.advance(Duration::from_millis(500));
        assert!(!bucket.consume("u1", "embed", 4.0, 1.0, 4.0).await.unwrap());
        assert_eq!(bucket.tokens("u1", "embed", 4.0, 1.0).await.unwrap(), 1.5);
    }

    #[tokio::test]
    async fn test_bucket_rejects_invalid_parameters() {
        let (_, bucket) = bucket();
        assert!(bucket.consume("u1", "a", 0.0, 1.0, 1.0).await.is_err());
        assert!(bucket.consume("u1", "a", 1.0, -1.0, 1.0).await.is_err());
        assert!(bucket.consume("u1", "a", 1.0, 1.0, 0.0).await.is_err());
        assert!(bucket.tokens("u1", "a", f64::NAN, 1.0).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bucket_no_double_spend_under_concurrency() {
        let (_, bucket) = bucket();
        let bucket = Arc::new(bucket);
        let tasks = (0..20).map(|_| {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.consume("u1", "embed", 5.0, 0.0, 1.0).await.unwrap() })
        });
        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 5);
    }
}
