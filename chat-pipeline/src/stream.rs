use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{error::AppError, storage::types::message::ChunkReference};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Completed streams linger briefly so clients can still resume them.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(30);

/// The in-flight answer for one (session, request) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveStream {
    pub session_id: String,
    pub request_id: String,
    pub query: String,
    pub content: String,
    pub references: Vec<ChunkReference>,
    pub is_completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl ActiveStream {
    fn new(session_id: &str, request_id: &str, query: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            request_id: request_id.to_owned(),
            query: query.to_owned(),
            content: String::new(),
            references: Vec::new(),
            is_completed: false,
            updated_at: Utc::now(),
        }
    }
}

/// Live-answer store with two interchangeable backends.
///
/// `update` and `complete` on an absent key are no-ops: the stream may have
/// expired. Snapshots are prefix-monotonic until completion.
#[async_trait]
pub trait StreamManager: Send + Sync {
    async fn register(
        &self,
        session_id: &str,
        request_id: &str,
        query: &str,
    ) -> Result<(), AppError>;

    /// Append a delta; a non-empty reference set replaces the stored one.
    async fn update(
        &self,
        session_id: &str,
        request_id: &str,
        delta: &str,
        references: Option<&[ChunkReference]>,
    ) -> Result<(), AppError>;

    async fn complete(&self, session_id: &str, request_id: &str) -> Result<(), AppError>;

    async fn get(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<ActiveStream>, AppError>;
}

// ---------------------------------------------------------------------------
// In-process variant
// ---------------------------------------------------------------------------

type StreamKey = (String, String);

pub struct MemoryStreamManager {
    streams: Arc<Mutex<HashMap<StreamKey, ActiveStream>>>,
    ttl: Duration,
    completed_retention: Duration,
}

impl MemoryStreamManager {
    pub fn new(ttl: Duration) -> Self {
        Self::with_retention(ttl, COMPLETED_RETENTION)
    }

    pub fn with_retention(ttl: Duration, completed_retention: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            completed_retention,
        }
    }

    fn key(session_id: &str, request_id: &str) -> StreamKey {
        (session_id.to_owned(), request_id.to_owned())
    }

    fn is_expired(&self, stream: &ActiveStream) -> bool {
        let age = Utc::now().signed_duration_since(stream.updated_at);
        age.to_std().is_ok_and(|age| age > self.ttl)
    }
}

#[async_trait]
impl StreamManager for MemoryStreamManager {
    async fn register(
        &self,
        session_id: &str,
        request_id: &str,
        query: &str,
    ) -> Result<(), AppError> {
        let mut streams = self.streams.lock().await;
        streams.insert(
            Self::key(session_id, request_id),
            ActiveStream::new(session_id, request_id, query),
        );
        Ok(())
    }

    async fn update(
        &self,
        session_id: &str,
        request_id: &str,
        delta: &str,
        references: Option<&[ChunkReference]>,
    ) -> Result<(), AppError> {
        let mut streams = self.streams.lock().await;
        let key = Self::key(session_id, request_id);

        let Some(stream) = streams.get_mut(&key) else {
            return Ok(());
        };
        if self.is_expired(stream) {
            streams.remove(&key);
            return Ok(());
        }

        stream.content.push_str(delta);
        if let Some(references) = references {
            if !references.is_empty() {
                stream.references = references.to_vec();
            }
        }
        stream.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(&self, session_id: &str, request_id: &str) -> Result<(), AppError> {
        let mut streams = self.streams.lock().await;
        let key = Self::key(session_id, request_id);

        let Some(stream) = streams.get_mut(&key) else {
            return Ok(());
        };
        stream.is_completed = true;
        stream.updated_at = Utc::now();

        let retention = self.completed_retention;
        let map = Arc::clone(&self.streams);
        let delete_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut streams = map.lock().await;
            streams.remove(&delete_key);
            debug!(
                session_id = %delete_key.0,
                request_id = %delete_key.1,
                "Deleted completed stream after retention window"
            );
        });

        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<ActiveStream>, AppError> {
        let mut streams = self.streams.lock().await;
        let key = Self::key(session_id, request_id);

        let Some(stream) = streams.get(&key) else {
            return Ok(None);
        };
        if self.is_expired(stream) {
            streams.remove(&key);
            return Ok(None);
        }
        Ok(Some(stream.clone()))
    }
}

// ---------------------------------------------------------------------------
// Redis-backed variant
// ---------------------------------------------------------------------------

pub struct RedisStreamManager {
    client: redis::Client,
    prefix: String,
    ttl: Duration,
}

impl RedisStreamManager {
    pub fn new(
        addr: &str,
        password: Option<&str>,
        db: i64,
        prefix: &str,
        ttl: Duration,
    ) -> Result<Self, AppError> {
        let url = match password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{password}@{addr}/{db}")
            }
            _ => format!("redis://{addr}/{db}"),
        };
        let client = redis::Client::open(url)
            .map_err(|err| AppError::Upstream(format!("Redis connection error: {err}")))?;
        Ok(Self {
            client,
            prefix: prefix.to_owned(),
            ttl,
        })
    }

    fn key(&self, session_id: &str, request_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, session_id, request_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| AppError::Upstream(format!("Redis connection error: {err}")))
    }

    async fn read(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
    ) -> Result<Option<ActiveStream>, AppError> {
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|err| AppError::Upstream(format!("Redis command error: {err}")))?;
        match value {
            Some(json) => {
                let stream = serde_json::from_str(&json).map_err(|err| {
                    AppError::Internal(format!("corrupt active-stream payload: {err}"))
                })?;
                Ok(Some(stream))
            }
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
        stream: &ActiveStream,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let json = serde_json::to_string(stream)
            .map_err(|err| AppError::Internal(format!("serialize active stream: {err}")))?;
        let () = conn
            .set_ex(key, json, ttl.as_secs().max(1))
            .await
            .map_err(|err| AppError::Upstream(format!("Redis command error: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl StreamManager for RedisStreamManager {
    async fn register(
        &self,
        session_id: &str,
        request_id: &str,
        query: &str,
    ) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let key = self.key(session_id, request_id);
        let stream = ActiveStream::new(session_id, request_id, query);
        self.write(&mut conn, &key, &stream, self.ttl).await
    }

    async fn update(
        &self,
        session_id: &str,
        request_id: &str,
        delta: &str,
        references: Option<&[ChunkReference]>,
    ) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let key = self.key(session_id, request_id);

        let Some(mut stream) = self.read(&mut conn, &key).await? else {
            return Ok(());
        };
        stream.content.push_str(delta);
        if let Some(references) = references {
            if !references.is_empty() {
                stream.references = references.to_vec();
            }
        }
        stream.updated_at = Utc::now();
        self.write(&mut conn, &key, &stream, self.ttl).await
    }

    async fn complete(&self, session_id: &str, request_id: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let key = self.key(session_id, request_id);

        let Some(mut stream) = self.read(&mut conn, &key).await? else {
            return Ok(());
        };
        stream.is_completed = true;
        stream.updated_at = Utc::now();
        // The retention TTL doubles as the delayed deletion.
        self.write(&mut conn, &key, &stream, COMPLETED_RETENTION)
            .await
    }

    async fn get(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<ActiveStream>, AppError> {
        let mut conn = self.connection().await?;
        let key = self.key(session_id, request_id);
        self.read(&mut conn, &key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::retrieval::MatchType;

    fn reference(chunk_id: &str) -> ChunkReference {
        ChunkReference {
            chunk_id: chunk_id.to_string(),
            knowledge_id: "k1".to_string(),
            score: 0.9,
            match_type: MatchType::Vector,
        }
    }

    #[tokio::test]
    async fn register_update_get_round_trip() {
        let manager = MemoryStreamManager::new(Duration::from_secs(60));
        manager.register("s1", "r1", "what?").await.expect("register");

        manager
            .update("s1", "r1", "Hello", Some(&[reference("c1")]))
            .await
            .expect("update");
        manager
            .update("s1", "r1", " world", None)
            .await
            .expect("update");

        let stream = manager
            .get("s1", "r1")
            .await
            .expect("get")
            .expect("stream exists");
        assert_eq!(stream.content, "Hello world");
        assert_eq!(stream.references.len(), 1);
        assert!(!stream.is_completed);
    }

    #[tokio::test]
    async fn snapshots_are_prefix_monotonic() {
        let manager = MemoryStreamManager::new(Duration::from_secs(60));
        manager.register("s1", "r1", "q").await.expect("register");

        let mut previous = String::new();
        for delta in ["a", "b", "c", "d"] {
            manager
                .update("s1", "r1", delta, None)
                .await
                .expect("update");
            let snapshot = manager
                .get("s1", "r1")
                .await
                .expect("get")
                .expect("stream exists");
            assert!(
                snapshot.content.starts_with(&previous),
                "later snapshot must extend the earlier one"
            );
            previous = snapshot.content;
        }
    }

    #[tokio::test]
    async fn update_on_absent_key_is_a_no_op() {
        let manager = MemoryStreamManager::new(Duration::from_secs(60));
        manager
            .update("s1", "missing", "delta", None)
            .await
            .expect("update absent");
        manager
            .complete("s1", "missing")
            .await
            .expect("complete absent");
        assert!(manager.get("s1", "missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn empty_reference_set_does_not_replace_existing() {
        let manager = MemoryStreamManager::new(Duration::from_secs(60));
        manager.register("s1", "r1", "q").await.expect("register");
        manager
            .update("s1", "r1", "", Some(&[reference("c1")]))
            .await
            .expect("set refs");
        manager
            .update("s1", "r1", "", Some(&[]))
            .await
            .expect("empty refs");

        let stream = manager
            .get("s1", "r1")
            .await
            .expect("get")
            .expect("stream exists");
        assert_eq!(stream.references.len(), 1);
    }

    #[tokio::test]
    async fn completed_stream_is_deleted_after_retention() {
        let manager = MemoryStreamManager::with_retention(
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        manager.register("s1", "r1", "q").await.expect("register");
        manager.complete("s1", "r1").await.expect("complete");

        let stream = manager
            .get("s1", "r1")
            .await
            .expect("get")
            .expect("still visible inside retention window");
        assert!(stream.is_completed);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(manager.get("s1", "r1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn expired_stream_is_evicted_on_access() {
        let manager = MemoryStreamManager::new(Duration::from_millis(20));
        manager.register("s1", "r1", "q").await.expect("register");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(manager.get("s1", "r1").await.expect("get").is_none());

        // A later update on the evicted key is a no-op rather than a revival.
        manager
            .update("s1", "r1", "late delta", None)
            .await
            .expect("late update");
        assert!(manager.get("s1", "r1").await.expect("get").is_none());
    }

    #[test]
    fn redis_key_layout_is_prefix_session_request() {
        let manager = RedisStreamManager::new("localhost:6379", None, 0, "active_stream",
            Duration::from_secs(60))
        .expect("client");
        assert_eq!(manager.key("s1", "r1"), "active_stream:s1:r1");
    }
}
