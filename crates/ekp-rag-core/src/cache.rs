//! Answer cache, hot-question ranking, and document cache.
//!
//! # Key layout
//!
//! | Key | Kind | TTL |
//! |-----|------|-----|
//! | `{prefix}:qa_cache:answer:{mode}:{hash}` | string (`CachePayload::Answer`) | answer ttl (1 h) |
//! | `{prefix}:qa_cache:stats:{hash}` | integer hit counter | stats ttl (30 min) |
//! | `{prefix}:qa_cache:hot_questions` | sorted set of normalized questions | none |
//! | `{prefix}:qa_cache:hot_entry:{hash}` | string (`CachePayload::HotQuestion`) | none, removed on eviction |
//! | `{prefix}:doc_cache:list:page:{page}:status:{status}` | string (`DocumentList`) | 5 min |
//! | `{prefix}:doc_cache:detail:{id}` | string (`DocumentDetail`) | 10 min |
//! | `{prefix}:doc_cache:chunks:{id}` | string (`DocumentChunks`) | 10 min |
//!
//! `{hash}` is the SHA-256 of the normalized question (trimmed, whitespace
//! collapsed, lowercased), so the answer key is partitioned by retrieval
//! mode while the hit counter is shared across modes.
//!
//! The hit counter expires independently of the answer, so popularity
//! cools off even while an answer stays cached. Hits never refresh the
//! answer's ttl.
//!
//! Every stored value is a [`CachePayload`] tagged with `"type"`. A value
//! that fails to decode, or decodes to the wrong variant, is logged and
//! treated as a miss.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::models::{RetrievalMode, SourceRef};
use crate::retrieve::preview;

/// Characters of answer text kept in a hot-question record.
pub const HOT_ANSWER_PREVIEW_CHARS: usize = 200;
pub const DOCUMENT_LIST_TTL: Duration = Duration::from_secs(300);
pub const DOCUMENT_DETAIL_TTL: Duration = Duration::from_secs(600);

/// Typed cache value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachePayload {
    Answer(CachedAnswer),
    HotQuestion(HotEntry),
    DocumentList { documents: Vec<serde_json::Value> },
    DocumentDetail { document: serde_json::Value },
    DocumentChunks { chunks: Vec<serde_json::Value> },
}

impl CachePayload {
    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(key: &str, raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(key, error = %e, "undecodable cache value, treating as miss");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub mode: RetrievalMode,
    pub cached_at: DateTime<Utc>,
}

/// Display record for a hot question, stored beside its sorted-set member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotEntry {
    pub question: String,
    pub answer: String,
    pub updated_at: DateTime<Utc>,
}

/// A hot question together with its popularity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotQuestion {
    pub question: String,
    pub answer: String,
    pub updated_at: DateTime<Utc>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub prefix: String,
    pub answer_ttl: Duration,
    pub stats_ttl: Duration,
    pub hot_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            prefix: "ekp".to_string(),
            answer_ttl: Duration::from_secs(3600),
            stats_ttl: Duration::from_secs(1800),
            hot_limit: 50,
        }
    }
}

/// Trim, collapse internal whitespace, and lowercase.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of the normalized question.
pub fn question_hash(question: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_question(question).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Question→answer memoization with popularity tracking.
pub struct AnswerCache {
    kv: Arc<dyn KvStore>,
    settings: CacheSettings,
}

impl AnswerCache {
    pub fn new(kv: Arc<dyn KvStore>, settings: CacheSettings) -> Self {
        Self { kv, settings }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn answer_key(&self, question: &str, mode: RetrievalMode) -> String {
        format!(
            "{}:qa_cache:answer:{}:{}",
            self.settings.prefix,
            mode,
            question_hash(question)
        )
    }

    fn answer_prefix(&self) -> String {
        format!("{}:qa_cache:answer:", self.settings.prefix)
    }

    fn stats_key(&self, question: &str) -> String {
        format!(
            "{}:qa_cache:stats:{}",
            self.settings.prefix,
            question_hash(question)
        )
    }

    fn hot_key(&self) -> String {
        format!("{}:qa_cache:hot_questions", self.settings.prefix)
    }

    fn hot_entry_key(&self, member: &str) -> String {
        format!(
            "{}:qa_cache:hot_entry:{}",
            self.settings.prefix,
            question_hash(member)
        )
    }

    /// Look up a cached answer. A hit is recorded via [`record_hit`](Self::record_hit).
    pub async fn get(&self, question: &str, mode: RetrievalMode) -> Result<Option<CachedAnswer>> {
        let key = self.answer_key(question, mode);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        match CachePayload::decode(&key, &raw) {
            Some(CachePayload::Answer(answer)) => {
                self.record_hit(question).await?;
                debug!(key = %key, "answer cache hit");
                Ok(Some(answer))
            }
            Some(_) => {
                warn!(key = %key, "unexpected payload type under answer key");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store an answer. `ttl` of `None` (or zero) uses the configured
    /// answer ttl; entries never live forever.
    pub async fn put(
        &self,
        question: &str,
        answer: &str,
        sources: &[SourceRef],
        mode: RetrievalMode,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.answer_key(question, mode);
        let payload = CachePayload::Answer(CachedAnswer {
            question: question.to_string(),
            answer: answer.to_string(),
            sources: sources.to_vec(),
            mode,
            cached_at: Utc::now(),
        });
        let ttl = ttl
            .filter(|t| !t.is_zero())
            .unwrap_or(self.settings.answer_ttl);
        self.kv.set(&key, &payload.encode()?, Some(ttl)).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "answer cached");
        Ok(())
    }

    /// Increment the question's hit counter, reset the counter's expiry,
    /// and bump its hot score when it is in the hot set. Returns the new
    /// hit count.
    pub async fn record_hit(&self, question: &str) -> Result<i64> {
        let key = self.stats_key(question);
        let hits = self.kv.incr(&key).await?;
        self.kv.expire(&key, self.settings.stats_ttl).await?;
        self.increment_hot_score(question).await?;
        Ok(hits)
    }

    pub async fn hit_count(&self, question: &str) -> Result<u64> {
        let raw = self.kv.get(&self.stats_key(question)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Insert a question into the hot set with score 1, or refresh its
    /// answer while keeping its score. The set is then trimmed to the
    /// `hot_limit` highest scores. A new entry that ranks lowest in a full
    /// set is evicted by the same call.
    ///
    /// The member is the normalized question, so concurrent inserts of one
    /// question land on the same member.
    pub async fn add_hot(&self, question: &str, answer: &str) -> Result<()> {
        let key = self.hot_key();
        let member = normalize_question(question);
        let entry = CachePayload::HotQuestion(HotEntry {
            question: question.to_string(),
            answer: preview(answer, HOT_ANSWER_PREVIEW_CHARS),
            updated_at: Utc::now(),
        })
        .encode()?;

        self.kv
            .set(&self.hot_entry_key(&member), &entry, None)
            .await?;
        self.kv.zadd_nx(&key, &member, 1.0).await?;

        let keep = self.settings.hot_limit as isize;
        let overflow = self.kv.zrevrange_with_scores(&key, keep, -1).await?;
        if overflow.is_empty() {
            return Ok(());
        }
        let evicted = self.kv.zremrangebyrank(&key, 0, -keep - 1).await?;
        let entry_keys: Vec<String> = overflow
            .iter()
            .map(|(m, _)| self.hot_entry_key(m))
            .collect();
        self.kv.delete(&entry_keys).await?;
        debug!(evicted, "hot questions trimmed");
        Ok(())
    }

    /// Add 1 to the question's hot score. Returns `false` if it is not in
    /// the hot set.
    pub async fn increment_hot_score(&self, question: &str) -> Result<bool> {
        let member = normalize_question(question);
        if self.kv.get(&self.hot_entry_key(&member)).await?.is_none() {
            return Ok(false);
        }
        self.kv.zincr_by(&self.hot_key(), &member, 1.0).await?;
        Ok(true)
    }

    /// Up to `limit` hot questions, highest score first.
    pub async fn get_hot(&self, limit: usize) -> Result<Vec<HotQuestion>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let members = self
            .kv
            .zrevrange_with_scores(&self.hot_key(), 0, limit as isize - 1)
            .await?;
        let mut hot = Vec::with_capacity(members.len());
        for (member, score) in members {
            let key = self.hot_entry_key(&member);
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            if let Some(CachePayload::HotQuestion(entry)) = CachePayload::decode(&key, &raw) {
                hot.push(HotQuestion {
                    question: entry.question,
                    answer: entry.answer,
                    updated_at: entry.updated_at,
                    score,
                });
            }
        }
        Ok(hot)
    }

    /// Drop one cached answer. Returns whether it existed.
    pub async fn invalidate(&self, question: &str, mode: RetrievalMode) -> Result<bool> {
        let removed = self.kv.delete(&[self.answer_key(question, mode)]).await?;
        Ok(removed > 0)
    }

    /// Drop every cached answer (all modes). Hit counters and the hot set
    /// are left alone.
    pub async fn clear_all(&self) -> Result<usize> {
        let keys = self.kv.keys_with_prefix(&self.answer_prefix()).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.kv.delete(&keys).await?;
        debug!(removed, "answer cache cleared");
        Ok(removed)
    }
}

/// Short-lived caches for document listings and details.
pub struct DocumentCache {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl DocumentCache {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: format!("{}:doc_cache", prefix),
        }
    }

    fn list_key(&self, page: u32, status: Option<&str>) -> String {
        format!(
            "{}:list:page:{}:status:{}",
            self.prefix,
            page,
            status.unwrap_or("all")
        )
    }

    fn detail_key(&self, document_id: &str) -> String {
        format!("{}:detail:{}", self.prefix, document_id)
    }

    fn chunks_key(&self, document_id: &str) -> String {
        format!("{}:chunks:{}", self.prefix, document_id)
    }

    async fn load(&self, key: &str) -> Result<Option<CachePayload>> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|raw| CachePayload::decode(key, &raw)))
    }

    pub async fn get_list(
        &self,
        page: u32,
        status: Option<&str>,
    ) -> Result<Option<Vec<serde_json::Value>>> {
        match self.load(&self.list_key(page, status)).await? {
            Some(CachePayload::DocumentList { documents }) => Ok(Some(documents)),
            _ => Ok(None),
        }
    }

    pub async fn put_list(
        &self,
        page: u32,
        status: Option<&str>,
        documents: &[serde_json::Value],
    ) -> Result<()> {
        let payload = CachePayload::DocumentList {
            documents: documents.to_vec(),
        };
        self.kv
            .set(
                &self.list_key(page, status),
                &payload.encode()?,
                Some(DOCUMENT_LIST_TTL),
            )
            .await
    }

    /// Drop every cached listing page. Returns how many were removed.
    pub async fn invalidate_lists(&self) -> Result<usize> {
        let keys = self
            .kv
            .keys_with_prefix(&format!("{}:list:", self.prefix))
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.kv.delete(&keys).await
    }

    pub async fn get_detail(&self, document_id: &str) -> Result<Option<serde_json::Value>> {
        match self.load(&self.detail_key(document_id)).await? {
            Some(CachePayload::DocumentDetail { document }) => Ok(Some(document)),
            _ => Ok(None),
        }
    }

    pub async fn put_detail(&self, document_id: &str, document: &serde_json::Value) -> Result<()> {
        let payload = CachePayload::DocumentDetail {
            document: document.clone(),
        };
        self.kv
            .set(
                &self.detail_key(document_id),
                &payload.encode()?,
                Some(DOCUMENT_DETAIL_TTL),
            )
            .await
    }

    pub async fn get_chunks(&self, document_id: &str) -> Result<Option<Vec<serde_json::Value>>> {
        match self.load(&self.chunks_key(document_id)).await? {
            Some(CachePayload::DocumentChunks { chunks }) => Ok(Some(chunks)),
            _ => Ok(None),
        }
    }

    pub async fn put_chunks(&self, document_id: &str, chunks: &[serde_json::Value]) -> Result<()> {
        let payload = CachePayload::DocumentChunks {
            chunks: chunks.to_vec(),
        };
        self.kv
            .set(
                &self.chunks_key(document_id),
                &payload.encode()?,
                Some(DOCUMENT_DETAIL_TTL),
            )
            .await
    }

    /// Drop the detail and chunk entries of one document.
    pub async fn invalidate_document(&self, document_id: &str) -> Result<bool> {
        let keys = [self.detail_key(document_id), self.chunks_key(document_id)];
        Ok(self.kv.delete(&keys).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::InMemoryKv;
    use crate::kv::ManualClock;
    use serde_json::json;

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryKv>, AnswerCache) {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(InMemoryKv::with_clock(clock.clone()));
        let cache = AnswerCache::new(kv.clone(), CacheSettings::default());
        (clock, kv, cache)
    }

    fn source() -> SourceRef {
        SourceRef {
            chunk_id: "c1".to_string(),
            document_id: "d1".to_string(),
            document_title: Some("Handbook".to_string()),
            content: "Leave requests go through HR.".to_string(),
            relevance_score: 0.82,
        }
    }

    #[test]
    fn test_normalize_and_hash() {
        assert_eq!(normalize_question("  How   DO I\tapply? "), "how do i apply?");
        assert_eq!(question_hash("How do I apply?"), question_hash(" how do i  APPLY? "));
        assert_ne!(question_hash("a"), question_hash("b"));
        assert_eq!(question_hash("x").len(), 64);
    }

    #[tokio::test]
    async fn test_get_after_put_then_expiry() {
        let (clock, _, cache) = setup();
        cache
            .put(
                "How do I request leave?",
                "Submit the form.",
                &[source()],
                RetrievalMode::Hybrid,
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let hit = cache
            .get("how do i request   leave?", RetrievalMode::Hybrid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.answer, "Submit the form.");
        assert_eq!(hit.sources, vec![source()]);

        clock.advance(Duration::from_secs(59));
        assert!(cache
            .get("How do I request leave?", RetrievalMode::Hybrid)
            .await
            .unwrap()
            .is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache
            .get("How do I request leave?", RetrievalMode::Hybrid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_default_ttl_applied() {
        let (_, kv, cache) = setup();
        cache
            .put("q", "a", &[], RetrievalMode::Vector, None)
            .await
            .unwrap();
        let key = cache.answer_key("q", RetrievalMode::Vector);
        assert_eq!(kv.ttl(&key), Some(Duration::from_secs(3600)));

        cache
            .put("q", "a", &[], RetrievalMode::Vector, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(kv.ttl(&key), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_modes_are_partitioned() {
        let (_, _, cache) = setup();
        cache
            .put("q", "vector answer", &[], RetrievalMode::Vector, None)
            .await
            .unwrap();
        assert!(cache.get("q", RetrievalMode::Hybrid).await.unwrap().is_none());

        cache
            .put("q", "hybrid answer", &[], RetrievalMode::Hybrid, None)
            .await
            .unwrap();
        let v = cache.get("q", RetrievalMode::Vector).await.unwrap().unwrap();
        let h = cache.get("q", RetrievalMode::Hybrid).await.unwrap().unwrap();
        assert_eq!(v.answer, "vector answer");
        assert_eq!(h.answer, "hybrid answer");
        assert_ne!(
            cache.answer_key("q", RetrievalMode::Vector),
            cache.answer_key("q", RetrievalMode::Hybrid)
        );
    }

    #[tokio::test]
    async fn test_corrupt_value_is_a_miss() {
        let (_, kv, cache) = setup();
        let key = cache.answer_key("q", RetrievalMode::Hybrid);
        kv.set(&key, "plain text, not json", None).await.unwrap();
        assert!(cache.get("q", RetrievalMode::Hybrid).await.unwrap().is_none());

        let wrong = json!({"type": "document_detail", "document": {}}).to_string();
        kv.set(&key, &wrong, None).await.unwrap();
        assert!(cache.get("q", RetrievalMode::Hybrid).await.unwrap().is_none());
        assert_eq!(cache.hit_count("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hits_counted_with_shorter_expiry() {
        let (clock, kv, cache) = setup();
        cache
            .put("q", "a", &[], RetrievalMode::Hybrid, None)
            .await
            .unwrap();
        cache.get("q", RetrievalMode::Hybrid).await.unwrap();
        cache.get("Q ", RetrievalMode::Vector).await.unwrap();
        cache.get("q", RetrievalMode::Hybrid).await.unwrap();
        assert_eq!(cache.hit_count("q").await.unwrap(), 2);

        let stats_key = format!("ekp:qa_cache:stats:{}", question_hash("q"));
        assert_eq!(kv.ttl(&stats_key), Some(Duration::from_secs(1800)));

        // The counter cools off while the answer is still cached.
        clock.advance(Duration::from_secs(1800));
        assert_eq!(cache.hit_count("q").await.unwrap(), 0);
        assert!(cache.get("q", RetrievalMode::Hybrid).await.unwrap().is_some());
        assert_eq!(cache.hit_count("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hot_questions_ranked_and_truncated() {
        let (_, _, cache) = setup();
        let long_answer = "x".repeat(300);
        cache.add_hot("first", &long_answer).await.unwrap();
        cache.add_hot("second", "short").await.unwrap();
        cache.put("second", "short", &[], RetrievalMode::Hybrid, None).await.unwrap();
        cache.get("second", RetrievalMode::Hybrid).await.unwrap();

        let hot = cache.get_hot(10).await.unwrap();
        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].question, "second");
        assert_eq!(hot[0].score, 2.0);
        assert_eq!(hot[1].answer.chars().count(), HOT_ANSWER_PREVIEW_CHARS + 3);
        assert!(hot[1].answer.ends_with("..."));

        assert_eq!(cache.get_hot(1).await.unwrap().len(), 1);
        assert!(cache.get_hot(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hot_readd_keeps_score_and_refreshes_answer() {
        let (_, _, cache) = setup();
        cache.add_hot("q", "old").await.unwrap();
        cache.increment_hot_score("q").await.unwrap();
        cache.increment_hot_score("q").await.unwrap();
        cache.add_hot("q", "new").await.unwrap();

        let hot = cache.get_hot(10).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].answer, "new");
        assert_eq!(hot[0].score, 3.0);
        assert!(!cache.increment_hot_score("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_hot_set_bounded_and_evicts_lowest() {
        let (_, _, cache) = setup();
        for i in 0..50 {
            cache.add_hot(&format!("q{:02}", i), "a").await.unwrap();
        }
        for i in 0..10 {
            cache.increment_hot_score(&format!("q{:02}", i)).await.unwrap();
        }
        for i in 50..70 {
            cache.add_hot(&format!("q{:02}", i), "a").await.unwrap();
            assert!(cache.get_hot(1000).await.unwrap().len() <= 50);
        }

        let hot = cache.get_hot(1000).await.unwrap();
        assert_eq!(hot.len(), 50);
        for i in 0..10 {
            let q = format!("q{:02}", i);
            assert!(hot.iter().any(|h| h.question == q && h.score == 2.0));
        }
        assert_eq!(hot.iter().filter(|h| h.score == 1.0).count(), 40);
    }

    #[tokio::test]
    async fn test_new_lowest_entry_evicted_immediately_when_full() {
        let (_, _, cache) = setup();
        for i in 0..50 {
            let q = format!("q{:02}", i);
            cache.add_hot(&q, "a").await.unwrap();
            cache.increment_hot_score(&q).await.unwrap();
        }
        cache.add_hot("brand new", "a").await.unwrap();

        let hot = cache.get_hot(1000).await.unwrap();
        assert_eq!(hot.len(), 50);
        assert!(hot.iter().all(|h| h.question != "brand new"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_hot_keeps_one_entry_per_question() {
        let (_, kv, cache) = setup();
        let cache = Arc::new(cache);
        let tasks = (0..16).map(|i| {
            let cache = cache.clone();
            let question = if i % 2 == 0 { "Annual leave?" } else { " annual  LEAVE? " };
            tokio::spawn(async move { cache.add_hot(question, "15 days").await.unwrap() })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let hot = cache.get_hot(10).await.unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].score, 1.0);
        assert_eq!(
            kv.zrevrange_with_scores("ekp:qa_cache:hot_questions", 0, -1)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_evicted_hot_entries_leave_no_record() {
        let (_, kv, _) = setup();
        let cache = AnswerCache::new(
            kv.clone(),
            CacheSettings {
                hot_limit: 2,
                ..CacheSettings::default()
            },
        );
        cache.add_hot("a", "x").await.unwrap();
        cache.increment_hot_score("a").await.unwrap();
        cache.add_hot("b", "x").await.unwrap();
        cache.increment_hot_score("b").await.unwrap();
        cache.add_hot("c", "x").await.unwrap();

        assert_eq!(kv.keys_with_prefix("ekp:qa_cache:hot_entry:").await.unwrap().len(), 2);
        assert!(!cache.increment_hot_score("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear_all() {
        let (_, kv, cache) = setup();
        for q in ["a", "b", "c"] {
            cache.put(q, "x", &[], RetrievalMode::Hybrid, None).await.unwrap();
        }
        cache.put("a", "x", &[], RetrievalMode::Vector, None).await.unwrap();
        cache.add_hot("a", "x").await.unwrap();

        assert!(cache.invalidate("b", RetrievalMode::Hybrid).await.unwrap());
        assert!(!cache.invalidate("b", RetrievalMode::Hybrid).await.unwrap());

        assert_eq!(cache.clear_all().await.unwrap(), 3);
        assert!(cache.get("a", RetrievalMode::Vector).await.unwrap().is_none());
        assert_eq!(cache.clear_all().await.unwrap(), 0);
        assert_eq!(cache.get_hot(10).await.unwrap().len(), 1);
        assert!(kv.keys_with_prefix("ekp:qa_cache:answer:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_document_cache_ttls_and_invalidation() {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(InMemoryKv::with_clock(clock.clone()));
        let docs = DocumentCache::new(kv.clone(), "ekp");

        let listing = vec![json!({"id": "d1", "title": "Handbook"})];
        docs.put_list(1, None, &listing).await.unwrap();
        docs.put_list(2, Some("ready"), &listing).await.unwrap();
        docs.put_detail("d1", &json!({"id": "d1"})).await.unwrap();
        docs.put_chunks("d1", &[json!({"index": 0})]).await.unwrap();

        assert_eq!(docs.get_list(1, None).await.unwrap(), Some(listing.clone()));
        assert!(docs.get_list(1, Some("ready")).await.unwrap().is_none());
        assert!(kv.get("ekp:doc_cache:list:page:2:status:ready").await.unwrap().is_some());

        clock.advance(DOCUMENT_LIST_TTL);
        assert!(docs.get_list(1, None).await.unwrap().is_none());
        assert!(docs.get_detail("d1").await.unwrap().is_some());

        docs.put_list(1, None, &listing).await.unwrap();
        assert_eq!(docs.invalidate_lists().await.unwrap(), 1);

        assert!(docs.invalidate_document("d1").await.unwrap());
        assert!(docs.get_detail("d1").await.unwrap().is_none());
        assert!(docs.get_chunks("d1").await.unwrap().is_none());
        assert!(!docs.invalidate_document("d1").await.unwrap());
    }
}
