//! Shared key-value store abstraction.
//!
//! The answer cache, distributed lock, rate limiters, and working memory all
//! coordinate through a [`KvStore`]: a Redis-shaped collaborator with
//! string, sorted-set, list, and hash operations plus one atomic primitive,
//! [`KvStore::eval`], that runs a multi-step [`Script`] in a single
//! round-trip.
//!
//! Anything that reads state and then writes based on what it read (lock
//! release and extension, fixed-window counting, token-bucket refill) must
//! go through `eval`. Separate `get` + `set` calls race under concurrent
//! callers.
//!
//! [`memory::InMemoryKv`] implements the trait in-process under a single
//! mutex. A Redis-backed implementation maps each [`Script`] onto
//! `EVAL` with [`Script::lua`], [`Script::keys`] and [`Script::args`].

pub mod clock;
pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use clock::{Clock, ManualClock, SystemClock};

/// Atomic multi-step operations executed by [`KvStore::eval`].
///
/// Every variant returns an integer reply: `1` for success/admitted and
/// `0` otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// Delete `key` only if its value equals `expected`.
    CompareAndDelete { key: String, expected: String },
    /// Reset the expiry of `key` to `ttl` only if its value equals
    /// `expected`.
    CompareAndExpire {
        key: String,
        expected: String,
        ttl: Duration,
    },
    /// Fixed-window counter: the first call in a window creates the
    /// counter with expiry `window`; later calls increment it while it is
    /// below `max_requests`. The window only resets by expiring.
    FixedWindow {
        key: String,
        max_requests: u64,
        window: Duration,
    },
    /// Lazy-refill token bucket stored as a hash `{tokens, last_refill}`.
    /// Admits when `min(capacity, tokens + elapsed × refill_rate)` reaches
    /// `requested` within [`REFILL_EPSILON`], then persists the decremented
    /// level with `now_us`. State is untouched on rejection.
    ///
    /// Times are integer microseconds so `elapsed` is an exact difference;
    /// absolute seconds as `f64` lose sub-microsecond steps near the
    /// current epoch.
    TokenBucket {
        key: String,
        capacity: f64,
        refill_rate: f64,
        requested: f64,
        /// Caller's clock, in Unix microseconds.
        now_us: i64,
        /// Expiry applied after each admitted request.
        idle_ttl: Duration,
    },
}

const COMPARE_AND_DELETE_LUA: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE_LUA: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const FIXED_WINDOW_LUA: &str = r#"
local max_requests = tonumber(ARGV[1])
if max_requests <= 0 then
    return 0
end
local current = redis.call('get', KEYS[1])
if not current then
    redis.call('set', KEYS[1], 1, 'PX', ARGV[2])
    return 1
end
if tonumber(current) >= max_requests then
    return 0
end
redis.call('incr', KEYS[1])
return 1
"#;

/// Slack on the token-bucket admission test. Absorbs rounding in
/// `elapsed × refill_rate` when the wait is exactly `1 / refill_rate`.
pub const REFILL_EPSILON: f64 = 1e-4;

const TOKEN_BUCKET_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now_us = tonumber(ARGV[4])
local epsilon = tonumber(ARGV[6])

local bucket = redis.call('hmget', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now_us

local elapsed_us = math.max(0, now_us - last_refill)
tokens = math.min(capacity, tokens + elapsed_us * refill_rate / 1000000)

if tokens + epsilon >= requested then
    redis.call('hset', KEYS[1], 'tokens', math.max(0, tokens - requested), 'last_refill', now_us)
    redis.call('pexpire', KEYS[1], ARGV[5])
    return 1
end
return 0
"#;

impl Script {
    /// Lua source for a Redis `EVAL` of this script.
    pub fn lua(&self) -> &'static str {
        match self {
            Script::CompareAndDelete { .. } => COMPARE_AND_DELETE_LUA,
            Script::CompareAndExpire { .. } => COMPARE_AND_EXPIRE_LUA,
            Script::FixedWindow { .. } => FIXED_WINDOW_LUA,
            Script::TokenBucket { .. } => TOKEN_BUCKET_LUA,
        }
    }

    /// `KEYS` for the Lua script.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Script::CompareAndDelete { key, .. }
            | Script::CompareAndExpire { key, .. }
            | Script::FixedWindow { key, .. }
            | Script::TokenBucket { key, .. } => vec![key.as_str()],
        }
    }

    /// `ARGV` for the Lua script. Durations are in milliseconds.
    pub fn args(&self) -> Vec<String> {
        match self {
            Script::CompareAndDelete { expected, .. } => vec![expected.clone()],
            Script::CompareAndExpire { expected, ttl, .. } => {
                vec![expected.clone(), ttl.as_millis().to_string()]
            }
            Script::FixedWindow {
                max_requests,
                window,
                ..
            } => vec![max_requests.to_string(), window.as_millis().to_string()],
            Script::TokenBucket {
                capacity,
                refill_rate,
                requested,
                now_us,
                idle_ttl,
                ..
            } => vec![
                capacity.to_string(),
                refill_rate.to_string(),
                requested.to_string(),
                now_us.to_string(),
                idle_ttl.as_millis().to_string(),
                REFILL_EPSILON.to_string(),
            ],
        }
    }
}

/// Abstract shared key-value store.
///
/// Every call may suspend and may be interleaved with calls from other
/// tasks or processes; only [`eval`](KvStore::eval) is atomic across
/// multiple steps. Expired keys behave as absent.
///
/// Ranges (`lrange`, `ltrim`, `zremrangebyrank`, `zrevrange_with_scores`)
/// are inclusive and accept negative indices counted from the end, as in
/// Redis.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value. `ttl = None` stores it without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only if `key` is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Increment an integer value, creating it at `1`. Keeps any expiry.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set the expiry of an existing key. Returns `false` if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Add or update a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Add a member only if absent (`ZADD NX`). Returns whether it was
    /// added; an existing member keeps its score.
    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<bool>;

    /// Add `delta` to a member's score (creating it at `delta`).
    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Members by descending score (ties by descending member).
    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;

    /// Remove members by ascending rank. Returns how many were removed.
    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<usize>;

    /// Append to a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Keep only the given range of a list.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    /// Run `script` atomically.
    async fn eval(&self, script: &Script) -> Result<i64>;
}
