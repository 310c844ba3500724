#![allow(clippy::module_name_repetitions)]
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnowledgeSource {
    File { file_name: String },
    Url { url: String },
}

impl KnowledgeSource {
    pub fn label(&self) -> &str {
        match self {
            KnowledgeSource::File { file_name } => file_name,
            KnowledgeSource::Url { url } => url,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

stored_object!(Knowledge, "knowledge", {
    kb_id: String,
    tenant_id: String,
    source: KnowledgeSource,
    content_hash: String,
    file_type: String,
    file_size: i64,
    status: KnowledgeStatus,
    error_message: Option<String>,
    raw_content: Option<Vec<u8>>
});

impl Knowledge {
    pub fn new(
        kb_id: String,
        tenant_id: String,
        source: KnowledgeSource,
        content_hash: String,
        file_type: String,
        file_size: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kb_id,
            tenant_id,
            source,
            content_hash,
            file_type,
            file_size,
            status: KnowledgeStatus::Pending,
            error_message: None,
            raw_content: None,
        }
    }

    pub fn content_hash_of(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Duplicate detection key: content-hash within one knowledge base.
    pub async fn find_by_hash(
        kb_id: &str,
        content_hash: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Knowledge>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM knowledge \
                 WHERE kb_id = $kb_id AND content_hash = $content_hash LIMIT 1",
            )
            .bind(("kb_id", kb_id.to_owned()))
            .bind(("content_hash", content_hash.to_owned()))
            .await?;
        let items: Vec<Knowledge> = response.take(0)?;
        Ok(items.into_iter().next())
    }

    pub async fn list_by_kb(
        kb_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Knowledge>, AppError> {
        let mut response = db
            .query("SELECT * FROM knowledge WHERE kb_id = $kb_id ORDER BY created_at")
            .bind(("kb_id", kb_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn get_many(
        ids: Vec<String>,
        db: &SurrealDbClient,
    ) -> Result<Vec<Knowledge>, AppError> {
        let things: Vec<surrealdb::sql::Thing> = ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from(("knowledge", id.as_str())))
            .collect();
        let mut response = db
            .query("SELECT * FROM knowledge WHERE id IN $things")
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn set_status(
        id: &str,
        status: KnowledgeStatus,
        error_message: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('knowledge', $id) SET \
             status = $status, error_message = $error_message, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("status", status))
        .bind(("error_message", error_message))
        .await?
        .check()?;
        Ok(())
    }
}
