//! Per-session working memory.
//!
//! Conversation turns are appended to the list `{prefix}:memory:session:{id}`
//! as JSON [`MemoryMessage`]s. Every append refreshes the session ttl
//! (1 hour) and trims the list to the newest [`MAX_SESSION_MESSAGES`].
//! Arbitrary per-session values live under
//! `{prefix}:memory:context:{id}:{key}`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kv::KvStore;
use crate::models::ChatMessage;

pub const SESSION_TTL: Duration = Duration::from_secs(3600);
pub const MAX_SESSION_MESSAGES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl From<MemoryMessage> for ChatMessage {
    fn from(m: MemoryMessage) -> Self {
        ChatMessage::new(m.role, m.content)
    }
}

pub struct WorkingMemory {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl WorkingMemory {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: format!("{}:memory", prefix),
        }
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    fn context_key(&self, session_id: &str, key: &str) -> String {
        format!("{}:context:{}:{}", self.prefix, session_id, key)
    }

    pub async fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let key = self.session_key(session_id);
        let message = MemoryMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
        };
        let len = self.kv.rpush(&key, &serde_json::to_string(&message)?).await?;
        self.kv.expire(&key, SESSION_TTL).await?;
        if len > MAX_SESSION_MESSAGES {
            self.kv
                .ltrim(&key, -(MAX_SESSION_MESSAGES as isize), -1)
                .await?;
        }
        Ok(())
    }

    fn decode(session_id: &str, raw: Vec<String>) -> Vec<MemoryMessage> {
        raw.into_iter()
            .filter_map(|m| match serde_json::from_str(&m) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(session_id, error = %e, "skipping undecodable memory entry");
                    None
                }
            })
            .collect()
    }

    /// The newest `limit` messages, oldest first.
    pub async fn messages(&self, session_id: &str, limit: usize) -> Result<Vec<MemoryMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .kv
            .lrange(&self.session_key(session_id), -(limit as isize), -1)
            .await?;
        Ok(Self::decode(session_id, raw))
    }

    pub async fn all_messages(&self, session_id: &str) -> Result<Vec<MemoryMessage>> {
        let raw = self.kv.lrange(&self.session_key(session_id), 0, -1).await?;
        Ok(Self::decode(session_id, raw))
    }

    /// The newest `limit` messages as completion history.
    pub async fn chat_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        Ok(self
            .messages(session_id, limit)
            .await?
            .into_iter()
            .map(ChatMessage::from)
            .collect())
    }

    pub async fn clear(&self, session_id: &str) -> Result<bool> {
        Ok(self.kv.delete(&[self.session_key(session_id)]).await? > 0)
    }

    pub async fn message_count(&self, session_id: &str) -> Result<usize> {
        self.kv.llen(&self.session_key(session_id)).await
    }

    pub async fn set_session_ttl(&self, session_id: &str, ttl: Duration) -> Result<bool> {
        self.kv.expire(&self.session_key(session_id), ttl).await
    }

    /// Store a JSON value for the session. Defaults to the session ttl.
    pub async fn set_context<T: Serialize + ?Sized>(
        &self,
        session_id: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv
            .set(
                &self.context_key(session_id, key),
                &raw,
                Some(ttl.unwrap_or(SESSION_TTL)),
            )
            .await
    }

    /// Read a session value. A value that does not decode as `T` is `None`.
    pub async fn get_context<T: DeserializeOwned>(
        &self,
        session_id: &str,
        key: &str,
    ) -> Result<Option<T>> {
        let Some(raw) = self.kv.get(&self.context_key(session_id, key)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(session_id, key, error = %e, "undecodable session context");
                Ok(None)
            }
        }
    }
}
