#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, retrieval::MatchType, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A cited passage: resolves to a chunk that existed at answer time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkReference {
    pub chunk_id: String,
    pub knowledge_id: String,
    pub score: f32,
    pub match_type: MatchType,
}

stored_object!(Message, "message", {
    session_id: String,
    request_id: String,
    role: MessageRole,
    content: String,
    references: Vec<ChunkReference>,
    is_deleted: bool
});

impl Message {
    pub fn new(
        session_id: String,
        request_id: String,
        role: MessageRole,
        content: String,
        references: Vec<ChunkReference>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            session_id,
            request_id,
            role,
            content,
            references,
            is_deleted: false,
        }
    }

    /// The `limit` newest messages with `created_at < before_time`, newest
    /// first. Soft-deleted messages are excluded.
    pub async fn load_before(
        session_id: &str,
        before_time: DateTime<Utc>,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Message>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM message \
                 WHERE session_id = $session_id \
                   AND created_at < $before_time \
                   AND is_deleted = false \
                 ORDER BY created_at DESC \
                 LIMIT $limit",
            )
            .bind(("session_id", session_id.to_owned()))
            .bind(("before_time", surrealdb::sql::Datetime::from(before_time)))
            .bind(("limit", limit as i64))
            .await?;
        Ok(response.take(0)?)
    }

    /// The most recent `count` messages in chronological order, as chat
    /// history for the pipeline (`max_rounds × 2`).
    pub async fn load_recent(
        session_id: &str,
        count: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Message>, AppError> {
        let mut messages = Self::load_before(session_id, Utc::now(), count, db).await?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn find_by_request(
        session_id: &str,
        request_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Message>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM message \
                 WHERE session_id = $session_id AND request_id = $request_id \
                   AND is_deleted = false \
                 LIMIT 1",
            )
            .bind(("session_id", session_id.to_owned()))
            .bind(("request_id", request_id.to_owned()))
            .await?;
        let messages: Vec<Message> = response.take(0)?;
        Ok(messages.into_iter().next())
    }

    pub async fn soft_delete(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('message', $id) SET is_deleted = true, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .await?
        .check()?;
        Ok(())
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "User"),
            MessageRole::Assistant => write!(f, "Assistant"),
            MessageRole::System => write!(f, "System"),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

// helper function to format a slice of messages for prompts
pub fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|msg| format!("{msg}"))
        .collect::<Vec<String>>()
        .join("\n")
}
