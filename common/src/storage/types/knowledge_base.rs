#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// How DocReader should split this knowledge base's documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
    pub enable_multimodal: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 64,
            separators: vec!["\n\n".to_string(), "\n".to_string(), ". ".to_string()],
            enable_multimodal: false,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.chunk_size == 0 {
            return Err(AppError::Validation("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::Validation(
                "chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if self.separators.is_empty() {
            return Err(AppError::Validation(
                "at least one separator is required".into(),
            ));
        }
        Ok(())
    }
}

/// Credentials for the external image store; carried as opaque data and
/// forwarded to DocReader for multimodal ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectStorageConfig {
    pub provider: String,
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub path_prefix: Option<String>,
}

stored_object!(KnowledgeBase, "knowledge_base", {
    tenant_id: String,
    name: String,
    description: String,
    chunking_config: ChunkingConfig,
    embedding_model_id: String,
    summary_model_id: String,
    rerank_model_id: Option<String>,
    vlm_model_id: Option<String>,
    object_storage: Option<ObjectStorageConfig>
});

impl KnowledgeBase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: String,
        name: String,
        description: String,
        chunking_config: ChunkingConfig,
        embedding_model_id: String,
        summary_model_id: String,
        rerank_model_id: Option<String>,
        vlm_model_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            name,
            description,
            chunking_config,
            embedding_model_id,
            summary_model_id,
            rerank_model_id,
            vlm_model_id,
            object_storage: None,
        }
    }

    pub async fn list_by_tenant(
        tenant_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<KnowledgeBase>, AppError> {
        let mut response = db
            .query("SELECT * FROM knowledge_base WHERE tenant_id = $tenant_id ORDER BY created_at")
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    /// The embedding model is frozen once the KB holds any knowledge, since
    /// existing index entries were produced with it.
    pub async fn has_knowledge(&self, db: &SurrealDbClient) -> Result<bool, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: u64,
        }

        let mut response = db
            .query("SELECT count() AS count FROM knowledge WHERE kb_id = $kb_id GROUP ALL")
            .bind(("kb_id", self.id.clone()))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().is_some_and(|row| row.count > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kb(tenant_id: &str) -> KnowledgeBase {
        KnowledgeBase::new(
            tenant_id.to_string(),
            "docs".to_string(),
            "product docs".to_string(),
            ChunkingConfig::default(),
            "embedding-model-1".to_string(),
            "summary-model-1".to_string(),
            None,
            None,
        )
    }

    #[test]
    fn test_chunking_config_rejects_overlap_not_smaller_than_size() {
        let config = ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..ChunkingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AppError::Validation(message)) if message.contains("chunk_overlap")
        ));
    }

    #[test]
    fn test_chunking_config_rejects_empty_separators() {
        let config = ChunkingConfig {
            separators: Vec::new(),
            ..ChunkingConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_chunking_config_default_is_valid() {
        assert!(ChunkingConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_list_by_tenant_scopes_results() {
        let db = SurrealDbClient::memory("kb_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let mine = test_kb("1");
        let other = test_kb("2");
        db.store_item(mine.clone()).await.expect("store kb");
        db.store_item(other).await.expect("store other kb");

        let listed = KnowledgeBase::list_by_tenant("1", &db)
            .await
            .expect("list kbs");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, mine.id);
    }

    #[tokio::test]
    async fn test_has_knowledge_reflects_existing_documents() {
        use crate::storage::types::knowledge::{Knowledge, KnowledgeSource};

        let db = SurrealDbClient::memory("kb_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let kb = test_kb("1");
        db.store_item(kb.clone()).await.expect("store kb");
        assert!(!kb.has_knowledge(&db).await.expect("count"));

        let knowledge = Knowledge::new(
            kb.id.clone(),
            "1".to_string(),
            KnowledgeSource::File {
                file_name: "a.txt".to_string(),
            },
            "hash-a".to_string(),
            "txt".to_string(),
            42,
        );
        db.store_item(knowledge).await.expect("store knowledge");

        assert!(kb.has_knowledge(&db).await.expect("count"));
    }
}
