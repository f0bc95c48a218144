//! In-process [`KvStore`] implementation.
//!
//! All keys live in one `HashMap` behind a `std::sync::Mutex`, so every
//! operation (including [`Script`] evaluation) is atomic with respect to
//! every other. Expiry is passive: an expired key is dropped the next time
//! it is touched and is never observable.
//!
//! Wrong-type access (e.g. `lrange` on a string) fails like Redis'
//! `WRONGTYPE` error.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::clock::{to_chrono, Clock, SystemClock};
use super::{KvStore, Script, REFILL_EPSILON};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory key-value store with a pluggable [`Clock`].
pub struct InMemoryKv {
    clock: Arc<dyn Clock>,
    data: Mutex<HashMap<String, Entry>>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining time-to-live of `key`, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let data = self.data.lock().unwrap();
        let entry = data.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.and_then(|at| (at - now).to_std().ok())
    }

    /// Run `f` against the live map, with expired keys already purged for
    /// the keys `f` will look at.
    fn with_data<T>(
        &self,
        keys: &[&str],
        f: impl FnOnce(&mut HashMap<String, Entry>, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let mut data = self.data.lock().unwrap();
        for key in keys {
            if data.get(*key).map_or(false, |e| !e.is_live(now)) {
                data.remove(*key);
            }
        }
        f(&mut data, now)
    }
}

fn wrong_type(key: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    )
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + to_chrono(ttl)
}

/// Resolve a Redis-style inclusive range against a collection length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Members sorted by ascending (score, member).
fn ascending(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    members
}

fn zset_mut<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, f64>> {
    let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::ZSet(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::ZSet(set) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

fn drop_if_empty(data: &mut HashMap<String, Entry>, key: &str) {
    let empty = match data.get(key).map(|e| &e.value) {
        Some(Value::ZSet(s)) => s.is_empty(),
        Some(Value::List(l)) => l.is_empty(),
        Some(Value::Hash(h)) => h.is_empty(),
        _ => false,
    };
    if empty {
        data.remove(key);
    }
}

fn string_value<'a>(data: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a str>> {
    match data.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(wrong_type(key)),
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_data(&[key], |data, _| {
            Ok(string_value(data, key)?.map(str::to_string))
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_data(&[key], |data, now| {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|t| expiry(now, t)),
                },
            );
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_data(&[key], |data, now| {
            if data.contains_key(key) {
                return Ok(false);
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(expiry(now, ttl)),
                },
            );
            Ok(true)
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.with_data(&refs, |data, _| {
            Ok(keys.iter().filter(|k| data.remove(k.as_str()).is_some()).count())
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.with_data(&[key], |data, _| match data.get_mut(key) {
            None => {
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => {
                let Ok(n) = s.parse::<i64>() else {
                    bail!("value at '{}' is not an integer", key);
                };
                *s = (n + 1).to_string();
                Ok(n + 1)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_data(&[key], |data, now| match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(expiry(now, ttl));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut data = self.data.lock().unwrap();
        data.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_data(&[key], |data, _| {
            zset_mut(data, key)?.insert(member.to_string(), score);
            Ok(())
        })
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.with_data(&[key], |data, _| {
            let set = zset_mut(data, key)?;
            if set.contains_key(member) {
                return Ok(false);
            }
            set.insert(member.to_string(), score);
            Ok(true)
        })
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.with_data(&[key], |data, _| {
            let score = zset_mut(data, key)?
                .entry(member.to_string())
                .or_insert(0.0);
            *score += delta;
            Ok(*score)
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.with_data(&[key], |data, _| {
            let removed = match data.get_mut(key).map(|e| &mut e.value) {
                None => false,
                Some(Value::ZSet(set)) => set.remove(member).is_some(),
                Some(_) => return Err(wrong_type(key)),
            };
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.with_data(&[key], |data, _| {
            let set = match data.get(key).map(|e| &e.value) {
                None => return Ok(Vec::new()),
                Some(Value::ZSet(set)) => set,
                Some(_) => return Err(wrong_type(key)),
            };
            let mut members = ascending(set);
            members.reverse();
            Ok(match resolve_range(members.len(), start, stop) {
                Some((s, e)) => members[s..=e].to_vec(),
                None => Vec::new(),
            })
        })
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<usize> {
        self.with_data(&[key], |data, _| {
            let set = match data.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(0),
                Some(Value::ZSet(set)) => set,
                Some(_) => return Err(wrong_type(key)),
            };
            let members = ascending(set);
            let removed = match resolve_range(members.len(), start, stop) {
                Some((s, e)) => {
                    for (member, _) in &members[s..=e] {
                        set.remove(member);
                    }
                    e - s + 1
                }
                None => 0,
            };
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        self.with_data(&[key], |data, _| {
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => {
                    list.push_back(value.to_string());
                    Ok(list.len())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.with_data(&[key], |data, _| {
            let list = match data.get(key).map(|e| &e.value) {
                None => return Ok(Vec::new()),
                Some(Value::List(list)) => list,
                Some(_) => return Err(wrong_type(key)),
            };
            Ok(match resolve_range(list.len(), start, stop) {
                Some((s, e)) => list.range(s..=e).cloned().collect(),
                None => Vec::new(),
            })
        })
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.with_data(&[key], |data, _| match data.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.with_data(&[key], |data, _| {
            let list = match data.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::List(list)) => list,
                Some(_) => return Err(wrong_type(key)),
            };
            match resolve_range(list.len(), start, stop) {
                Some((s, e)) => {
                    list.truncate(e + 1);
                    list.drain(..s);
                }
                None => list.clear(),
            }
            drop_if_empty(data, key);
            Ok(())
        })
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        self.with_data(&[key], |data, _| match data.get(key).map(|e| &e.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn eval(&self, script: &Script) -> Result<i64> {
        let keys = script.keys();
        self.with_data(&keys, |data, now| match script {
            Script::CompareAndDelete { key, expected } => {
                if string_value(data, key)? == Some(expected.as_str()) {
                    data.remove(key);
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            Script::CompareAndExpire { key, expected, ttl } => {
                if string_value(data, key)? == Some(expected.as_str()) {
                    if let Some(entry) = data.get_mut(key) {
                        entry.expires_at = Some(expiry(now, *ttl));
                    }
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            Script::FixedWindow {
                key,
                max_requests,
                window,
            } => {
                if *max_requests == 0 {
                    return Ok(0);
                }
                let stored = string_value(data, key)?.map(|v| v.parse::<u64>().unwrap_or(0));
                let Some(current) = stored else {
                    data.insert(
                        key.clone(),
                        Entry {
                            value: Value::Str("1".to_string()),
                            expires_at: Some(expiry(now, *window)),
                        },
                    );
                    return Ok(1);
                };
                if current >= *max_requests {
                    return Ok(0);
                }
                if let Some(entry) = data.get_mut(key) {
                    entry.value = Value::Str((current + 1).to_string());
                }
                Ok(1)
            }
            Script::TokenBucket {
                key,
                capacity,
                refill_rate,
                requested,
                now_us,
                idle_ttl,
            } => {
                let (stored_tokens, stored_refill) = match data.get(key).map(|e| &e.value) {
                    None => (None, None),
                    Some(Value::Hash(hash)) => (
                        hash.get("tokens").and_then(|v| v.parse::<f64>().ok()),
                        hash.get("last_refill").and_then(|v| v.parse::<i64>().ok()),
                    ),
                    Some(_) => return Err(wrong_type(key)),
                };
                let tokens = stored_tokens.unwrap_or(*capacity);
                let elapsed_us = now_us.saturating_sub(stored_refill.unwrap_or(*now_us)).max(0);
                let tokens = capacity.min(tokens + elapsed_us as f64 * refill_rate / 1_000_000.0);
                if tokens + REFILL_EPSILON < *requested {
                    return Ok(0);
                }
                let mut hash = HashMap::new();
                hash.insert("tokens".to_string(), (tokens - requested).max(0.0).to_string());
                hash.insert("last_refill".to_string(), now_us.to_string());
                data.insert(
                    key.clone(),
                    Entry {
                        value: Value::Hash(hash),
                        expires_at: Some(expiry(now, *idle_ttl)),
                    },
                );
                Ok(1)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::ManualClock;

    fn store() -> (Arc<ManualClock>, InMemoryKv) {
        let clock = Arc::new(ManualClock::default());
        let kv = InMemoryKv::with_clock(clock.clone());
        (clock, kv)
    }

    #[tokio::test]
    async fn test_set_get_with_ttl() {
        let (clock, kv) = store();
        kv.set("a", "1", Some(Duration::from_secs(10))).await.unwrap();
        kv.set("b", "2", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.ttl("a"), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.get("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(kv.ttl("b"), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing_until_expiry() {
        let (clock, kv) = store();
        assert!(kv.set_nx("k", "x", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_nx("k", "y", Duration::from_secs(5)).await.unwrap());
        clock.advance(Duration::from_secs(6));
        assert!(kv.set_nx("k", "y", Duration::from_secs(5)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_incr_delete_and_prefix_scan() {
        let (_, kv) = store();
        assert_eq!(kv.incr("p:n").await.unwrap(), 1);
        assert_eq!(kv.incr("p:n").await.unwrap(), 2);
        kv.set("p:s", "v", None).await.unwrap();
        kv.set("q:s", "v", None).await.unwrap();
        assert_eq!(kv.keys_with_prefix("p:").await.unwrap(), vec!["p:n", "p:s"]);
        assert_eq!(
            kv.delete(&["p:n".to_string(), "missing".to_string()])
                .await
                .unwrap(),
            1
        );
        assert!(kv.incr("q:s").await.is_err());
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_trim() {
        let (_, kv) = store();
        kv.zadd("z", "a", 1.0).await.unwrap();
        kv.zadd("z", "b", 3.0).await.unwrap();
        kv.zadd("z", "c", 2.0).await.unwrap();
        assert_eq!(kv.zincr_by("z", "a", 5.0).await.unwrap(), 6.0);
        assert!(!kv.zadd_nx("z", "a", 1.0).await.unwrap());
        assert!(kv.zadd_nx("z2", "a", 1.0).await.unwrap());

        let all = kv.zrevrange_with_scores("z", 0, -1).await.unwrap();
        let names: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        // Keep the top two: remove everything below rank -2.
        assert_eq!(kv.zremrangebyrank("z", 0, -3).await.unwrap(), 1);
        let top = kv.zrevrange_with_scores("z", 0, 9).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!(kv.zrem("z", "a").await.unwrap());
        assert!(!kv.zrem("z", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_push_range_trim() {
        let (_, kv) = store();
        for i in 0..5 {
            kv.rpush("l", &i.to_string()).await.unwrap();
        }
        assert_eq!(kv.llen("l").await.unwrap(), 5);
        assert_eq!(kv.lrange("l", -2, -1).await.unwrap(), vec!["3", "4"]);
        kv.ltrim("l", -3, -1).await.unwrap();
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["2", "3", "4"]);
        kv.ltrim("l", 5, 10).await.unwrap();
        assert_eq!(kv.llen("l").await.unwrap(), 0);
        assert_eq!(kv.get("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_delete_only_matching_owner() {
        let (_, kv) = store();
        kv.set("lock", "owner-a", None).await.unwrap();
        let wrong = Script::CompareAndDelete {
            key: "lock".to_string(),
            expected: "owner-b".to_string(),
        };
        assert_eq!(kv.eval(&wrong).await.unwrap(), 0);
        assert!(kv.get("lock").await.unwrap().is_some());

        let right = Script::CompareAndDelete {
            key: "lock".to_string(),
            expected: "owner-a".to_string(),
        };
        assert_eq!(kv.eval(&right).await.unwrap(), 1);
        assert!(kv.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fixed_window_counts_then_resets() {
        let (clock, kv) = store();
        let script = Script::FixedWindow {
            key: "w".to_string(),
            max_requests: 2,
            window: Duration::from_secs(60),
        };
        assert_eq!(kv.eval(&script).await.unwrap(), 1);
        assert_eq!(kv.eval(&script).await.unwrap(), 1);
        assert_eq!(kv.eval(&script).await.unwrap(), 0);
        assert_eq!(kv.get("w").await.unwrap().as_deref(), Some("2"));

        clock.advance(Duration::from_secs(60));
        assert_eq!(kv.eval(&script).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_token_bucket_state_is_a_hash() {
        let (clock, kv) = store();
        let script = Script::TokenBucket {
            key: "tb".to_string(),
            capacity: 2.0,
            refill_rate: 1.0,
            requested: 1.0,
            now_us: clock.unix_micros(),
            idle_ttl: Duration::from_secs(3600),
        };
        assert_eq!(kv.eval(&script).await.unwrap(), 1);
        let fields = kv.hmget("tb", &["tokens", "last_refill"]).await.unwrap();
        assert_eq!(fields[0].as_deref(), Some("1"));
        assert!(fields[1].is_some());
        assert_eq!(kv.ttl("tb"), Some(Duration::from_secs(3600)));
    }
}
