#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    ImageOcr,
    ImageCaption,
    Summary,
    Entity,
    Relationship,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSpan {
    pub start: usize,
    pub end: usize,
}

/// Image metadata attached to a chunk by DocReader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageInfo {
    pub url: String,
    pub original_url: Option<String>,
    pub caption: Option<String>,
    pub ocr_text: Option<String>,
    pub span: Option<ImageSpan>,
}

stored_object!(Chunk, "chunk", {
    tenant_id: String,
    kb_id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
    start_at: usize,
    end_at: usize,
    pre_chunk_id: Option<String>,
    next_chunk_id: Option<String>,
    chunk_type: ChunkType,
    parent_chunk_id: Option<String>,
    image_info: Option<Vec<ImageInfo>>,
    is_enabled: bool
});

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: String,
        kb_id: String,
        knowledge_id: String,
        chunk_index: u32,
        content: String,
        start_at: usize,
        end_at: usize,
        chunk_type: ChunkType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            kb_id,
            knowledge_id,
            chunk_index,
            content,
            start_at,
            end_at,
            pre_chunk_id: None,
            next_chunk_id: None,
            chunk_type,
            parent_chunk_id: None,
            image_info: None,
            is_enabled: true,
        }
    }

    /// Chunks of one knowledge item in chunk-index order.
    pub async fn list_by_knowledge(
        knowledge_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM chunk WHERE knowledge_id = $knowledge_id \
                 ORDER BY chunk_index",
            )
            .bind(("knowledge_id", knowledge_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn get_many(ids: Vec<String>, db: &SurrealDbClient) -> Result<Vec<Chunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<surrealdb::sql::Thing> = ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from(("chunk", id.as_str())))
            .collect();
        let mut response = db
            .query("SELECT * FROM chunk WHERE id IN $things")
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn delete_by_knowledge(
        knowledge_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query("DELETE chunk WHERE knowledge_id = $knowledge_id")
            .bind(("knowledge_id", knowledge_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn set_enabled(
        id: &str,
        is_enabled: bool,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('chunk', $id) SET \
             is_enabled = $is_enabled, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("is_enabled", is_enabled))
        .await?
        .check()?;
        Ok(())
    }
}

/// Rebuild the pre/next chain for chunks that belong to one knowledge item.
/// The slice must already be in chunk-index order.
pub fn link_chunk_chain(chunks: &mut [Chunk]) {
    let ids: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();
    for (position, chunk) in chunks.iter_mut().enumerate() {
        chunk.pre_chunk_id = position
            .checked_sub(1)
            .and_then(|previous| ids.get(previous).cloned());
        chunk.next_chunk_id = ids.get(position.saturating_add(1)).cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chunk(knowledge_id: &str, index: u32, content: &str) -> Chunk {
        Chunk::new(
            "1".to_string(),
            "kb-a".to_string(),
            knowledge_id.to_string(),
            index,
            content.to_string(),
            0,
            content.len(),
            ChunkType::Text,
        )
    }

    #[test]
    fn test_link_chunk_chain_builds_doubly_linked_list() {
        let mut chunks = vec![
            test_chunk("k1", 0, "first"),
            test_chunk("k1", 1, "second"),
            test_chunk("k1", 2, "third"),
        ];
        link_chunk_chain(&mut chunks);

        assert!(chunks[0].pre_chunk_id.is_none());
        assert_eq!(chunks[0].next_chunk_id.as_deref(), Some(chunks[1].id.as_str()));
        assert_eq!(chunks[1].pre_chunk_id.as_deref(), Some(chunks[0].id.as_str()));
        assert_eq!(chunks[1].next_chunk_id.as_deref(), Some(chunks[2].id.as_str()));
        assert_eq!(chunks[2].pre_chunk_id.as_deref(), Some(chunks[1].id.as_str()));
        assert!(chunks[2].next_chunk_id.is_none());
    }

    #[tokio::test]
    async fn test_list_by_knowledge_preserves_chunk_index_order() {
        let db = SurrealDbClient::memory("chunk_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        for index in [2u32, 0, 1] {
            let chunk = test_chunk("k1", index, &format!("chunk {index}"));
            db.store_item(chunk).await.expect("store chunk");
        }

        let listed = Chunk::list_by_knowledge("k1", &db).await.expect("list");
        let indexes: Vec<u32> = listed.iter().map(|chunk| chunk.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_delete_by_knowledge_removes_only_that_document() {
        let db = SurrealDbClient::memory("chunk_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        db.store_item(test_chunk("k1", 0, "keep")).await.expect("store");
        db.store_item(test_chunk("k2", 0, "drop")).await.expect("store");

        Chunk::delete_by_knowledge("k2", &db).await.expect("delete");

        assert_eq!(Chunk::list_by_knowledge("k1", &db).await.expect("list").len(), 1);
        assert!(Chunk::list_by_knowledge("k2", &db).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_get_many_with_empty_ids_is_empty() {
        let db = SurrealDbClient::memory("chunk_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        let chunks = Chunk::get_many(Vec::new(), &db).await.expect("get many");
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_set_enabled_toggles_flag() {
        let db = SurrealDbClient::memory("chunk_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let chunk = test_chunk("k1", 0, "body");
        db.store_item(chunk.clone()).await.expect("store");

        Chunk::set_enabled(&chunk.id, false, &db).await.expect("disable");

        let reloaded: Chunk = db.get_item(&chunk.id).await.expect("fetch").expect("exists");
        assert!(!reloaded.is_enabled);
    }
}
