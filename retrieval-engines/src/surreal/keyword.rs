use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    retrieval::{MatchType, RetrieverType},
    storage::{
        db::{SurrealDbClient, FTS_ANALYZER_NAME},
        types::chunk::deserialize_flexible_id,
    },
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{IndexEntry, RetrievalEngine, RetrieveParams, RetrieveResult};

use super::SURREAL_KEYWORD;

const TABLE: &str = "keyword_index";
const INDEX_NAME: &str = "idx_keyword_index_content";

#[derive(Debug, Serialize)]
struct KeywordRow {
    kb_id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
}

#[derive(Debug, Deserialize)]
struct KeywordHit {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    kb_id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct StoredKeywordRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
}

/// Keyword index backed by a SurrealDB BM25 full-text search table.
pub struct SurrealKeywordEngine {
    db: Arc<SurrealDbClient>,
}

impl SurrealKeywordEngine {
    pub async fn new(db: Arc<SurrealDbClient>) -> Result<Self, AppError> {
        let engine = Self { db };
        engine.ensure_schema().await?;
        Ok(engine)
    }

    async fn ensure_schema(&self) -> Result<(), AppError> {
        // The shared analyzer may not exist yet when the driver comes up first.
        self.db
            .query(format!(
                "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME} \
                 TOKENIZERS class FILTERS lowercase, ascii;"
            ))
            .await?
            .check()?;
        self.db
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS {INDEX_NAME} ON TABLE {TABLE} \
                 FIELDS content SEARCH ANALYZER {FTS_ANALYZER_NAME} BM25;"
            ))
            .await?
            .check()?;
        Ok(())
    }

    fn to_row(entry: &IndexEntry) -> KeywordRow {
        KeywordRow {
            kb_id: entry.kb_id.clone(),
            knowledge_id: entry.knowledge_id.clone(),
            chunk_index: entry.chunk_index,
            content: entry.content.clone(),
        }
    }
}

#[async_trait]
impl RetrievalEngine for SurrealKeywordEngine {
    fn engine_type(&self) -> &'static str {
        SURREAL_KEYWORD
    }

    fn supports(&self) -> &[RetrieverType] {
        &[RetrieverType::Keyword]
    }

    async fn save(&self, entry: &IndexEntry) -> Result<(), AppError> {
        let row = Self::to_row(entry);
        let _: Option<serde_json::Value> = self
            .db
            .client
            .upsert((TABLE, entry.chunk_id.as_str()))
            .content(row)
            .await?;
        Ok(())
    }

    async fn batch_save(&self, entries: &[IndexEntry]) -> Result<(), AppError> {
        for entry in entries {
            self.save(entry).await?;
        }
        Ok(())
    }

    async fn delete_by_chunk_ids(
        &self,
        chunk_ids: &[String],
        _dimension: usize,
    ) -> Result<(), AppError> {
        let things: Vec<surrealdb::sql::Thing> = chunk_ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from((TABLE, id.as_str())))
            .collect();
        self.db
            .query(format!("DELETE {TABLE} WHERE id IN $things"))
            .bind(("things", things))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_by_knowledge_ids(
        &self,
        knowledge_ids: &[String],
        _dimension: usize,
    ) -> Result<(), AppError> {
        self.db
            .query(format!("DELETE {TABLE} WHERE knowledge_id IN $ids"))
            .bind(("ids", knowledge_ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }

    async fn copy_indices(
        &self,
        src_kb_id: &str,
        dst_kb_id: &str,
        chunk_id_map: &HashMap<String, String>,
        knowledge_id_map: &HashMap<String, String>,
        _dimension: usize,
    ) -> Result<(), AppError> {
        let mut response = self
            .db
            .query(format!("SELECT * FROM {TABLE} WHERE kb_id = $kb_id"))
            .bind(("kb_id", src_kb_id.to_owned()))
            .await?;
        let rows: Vec<StoredKeywordRow> = response.take(0)?;

        debug!(
            engine = SURREAL_KEYWORD,
            source_rows = rows.len(),
            "Copying keyword index entries"
        );

        for row in rows {
            let Some(new_chunk_id) = chunk_id_map.get(&row.id) else {
                continue;
            };
            let new_knowledge_id = knowledge_id_map
                .get(&row.knowledge_id)
                .cloned()
                .unwrap_or(row.knowledge_id);
            let copied = KeywordRow {
                kb_id: dst_kb_id.to_owned(),
                knowledge_id: new_knowledge_id,
                chunk_index: row.chunk_index,
                content: row.content,
            };
            let _: Option<serde_json::Value> = self
                .db
                .client
                .upsert((TABLE, new_chunk_id.as_str()))
                .content(copied)
                .await?;
        }
        Ok(())
    }

    async fn retrieve(&self, params: &RetrieveParams) -> Result<Vec<RetrieveResult>, AppError> {
        if params.top_k == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id, kb_id, knowledge_id, chunk_index, content, \
             IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score \
             FROM {TABLE} \
             WHERE content @0@ $terms \
               AND kb_id IN $kb_ids \
             ORDER BY score DESC \
             LIMIT $limit;"
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("terms", params.query.clone()))
            .bind(("kb_ids", params.kb_ids.clone()))
            .bind(("limit", params.top_k as i64))
            .await?;
        let hits: Vec<KeywordHit> = response.take(0)?;

        Ok(hits
            .into_iter()
            .filter(|hit| hit.score >= params.threshold)
            .map(|hit| RetrieveResult {
                chunk_id: hit.id,
                kb_id: hit.kb_id,
                knowledge_id: hit.knowledge_id,
                chunk_index: hit.chunk_index,
                content: hit.content,
                score: hit.score,
                match_type: MatchType::Keyword,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_engine() -> SurrealKeywordEngine {
        let db = Arc::new(
            SurrealDbClient::memory("keyword_engine_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        SurrealKeywordEngine::new(db).await.expect("engine init")
    }

    fn entry(chunk_id: &str, kb_id: &str, knowledge_id: &str, content: &str) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            kb_id: kb_id.to_string(),
            knowledge_id: knowledge_id.to_string(),
            chunk_index: 0,
            content: content.to_string(),
            embedding: None,
        }
    }

    fn params(kb_id: &str, query: &str, top_k: usize) -> RetrieveParams {
        RetrieveParams {
            query: query.to_string(),
            query_embedding: None,
            kb_ids: vec![kb_id.to_string()],
            top_k,
            threshold: 0.0,
            retriever_type: RetrieverType::Keyword,
        }
    }

    #[tokio::test]
    async fn keyword_search_finds_matching_content() {
        let engine = test_engine().await;

        engine
            .save(&entry("c1", "kb-a", "k1", "comets are icy bodies"))
            .await
            .expect("save c1");
        engine
            .save(&entry("c2", "kb-a", "k1", "planets orbit the sun"))
            .await
            .expect("save c2");

        let results = engine
            .retrieve(&params("kb-a", "comets", 10))
            .await
            .expect("retrieve");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c1");
        assert_eq!(results[0].match_type, MatchType::Keyword);
        assert!(results[0].score > 0.0);
    }

    #[tokio::test]
    async fn keyword_search_is_scoped_to_kb() {
        let engine = test_engine().await;

        engine
            .save(&entry("c1", "kb-a", "k1", "shared term rocket"))
            .await
            .expect("save kb-a");
        engine
            .save(&entry("c2", "kb-b", "k2", "shared term rocket"))
            .await
            .expect("save kb-b");

        let results = engine
            .retrieve(&params("kb-a", "rocket", 10))
            .await
            .expect("retrieve");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn save_is_idempotent_on_chunk_id() {
        let engine = test_engine().await;

        let one = entry("c1", "kb-a", "k1", "repeated insert body");
        engine.save(&one).await.expect("first save");
        engine.save(&one).await.expect("second save");

        let results = engine
            .retrieve(&params("kb-a", "repeated", 10))
            .await
            .expect("retrieve");
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn delete_by_chunk_ids_removes_entries() {
        let engine = test_engine().await;

        engine
            .save(&entry("c1", "kb-a", "k1", "deletable body"))
            .await
            .expect("save");
        engine
            .delete_by_chunk_ids(&["c1".to_string()], 0)
            .await
            .expect("delete");

        let results = engine
            .retrieve(&params("kb-a", "deletable", 10))
            .await
            .expect("retrieve");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn copy_indices_duplicates_under_new_ids() {
        let engine = test_engine().await;

        engine
            .save(&entry("c1", "kb-a", "k1", "transferable body"))
            .await
            .expect("save");

        let chunk_map = HashMap::from([("c1".to_string(), "c1-copy".to_string())]);
        let knowledge_map = HashMap::from([("k1".to_string(), "k1-copy".to_string())]);
        engine
            .copy_indices("kb-a", "kb-b", &chunk_map, &knowledge_map, 0)
            .await
            .expect("copy");

        let copied = engine
            .retrieve(&params("kb-b", "transferable", 10))
            .await
            .expect("retrieve copy");
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].chunk_id, "c1-copy");
        assert_eq!(copied[0].knowledge_id, "k1-copy");
    }
}
