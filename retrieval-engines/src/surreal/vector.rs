use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    retrieval::{MatchType, RetrieverType},
    storage::{db::SurrealDbClient, types::chunk::deserialize_flexible_id},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{IndexEntry, RetrievalEngine, RetrieveParams, RetrieveResult};

use super::SURREAL_VECTOR;

const TABLE: &str = "vector_index";
const INDEX_NAME: &str = "idx_vector_index_embedding";
const KNN_EF: usize = 100;

#[derive(Debug, Serialize)]
struct VectorRow {
    kb_id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct VectorHit {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    kb_id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct StoredVectorRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    knowledge_id: String,
    chunk_index: u32,
    content: String,
    embedding: Vec<f32>,
}

/// Dense-vector index backed by a SurrealDB HNSW table.
pub struct SurrealVectorEngine {
    db: Arc<SurrealDbClient>,
}

impl SurrealVectorEngine {
    pub async fn new(db: Arc<SurrealDbClient>, dimension: usize) -> Result<Self, AppError> {
        let engine = Self { db };
        engine.ensure_schema(dimension).await?;
        Ok(engine)
    }

    async fn ensure_schema(&self, dimension: usize) -> Result<(), AppError> {
        self.db
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS {INDEX_NAME} ON TABLE {TABLE} \
                 FIELDS embedding HNSW DIMENSION {dimension} \
                 DIST COSINE TYPE F32 EFC 100 M 8;"
            ))
            .await?
            .check()?;
        Ok(())
    }

    fn to_row(entry: &IndexEntry) -> Result<VectorRow, AppError> {
        let embedding = entry.embedding.clone().ok_or_else(|| {
            AppError::Validation(format!(
                "index entry for chunk '{}' carries no embedding",
                entry.chunk_id
            ))
        })?;
        Ok(VectorRow {
            kb_id: entry.kb_id.clone(),
            knowledge_id: entry.knowledge_id.clone(),
            chunk_index: entry.chunk_index,
            content: entry.content.clone(),
            embedding,
        })
    }
}

#[async_trait]
impl RetrievalEngine for SurrealVectorEngine {
    fn engine_type(&self) -> &'static str {
        SURREAL_VECTOR
    }

    fn supports(&self) -> &[RetrieverType] {
        &[RetrieverType::Vector]
    }

    async fn save(&self, entry: &IndexEntry) -> Result<(), AppError> {
        let row = Self::to_row(entry)?;
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
        let rows: Vec<StoredVectorRow> = response.take(0)?;

        debug!(
            engine = SURREAL_VECTOR,
            source_rows = rows.len(),
            "Copying vector index entries"
        );

        for row in rows {
            let Some(new_chunk_id) = chunk_id_map.get(&row.id) else {
                continue;
            };
            let new_knowledge_id = knowledge_id_map
                .get(&row.knowledge_id)
                .cloned()
                .unwrap_or(row.knowledge_id);
            let copied = VectorRow {
                kb_id: dst_kb_id.to_owned(),
                knowledge_id: new_knowledge_id,
                chunk_index: row.chunk_index,
                content: row.content,
                embedding: row.embedding,
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
        let embedding = params
            .query_embedding
            .clone()
            .ok_or_else(|| AppError::Validation("vector retrieval requires a query embedding".into()))?;

        if params.top_k == 0 {
            return Ok(Vec::new());
        }

        let take = params.top_k;
        let sql = format!(
            "SELECT id, kb_id, knowledge_id, chunk_index, content, \
             vector::similarity::cosine(embedding, $embedding) AS score \
             FROM {TABLE} \
             WHERE kb_id IN $kb_ids \
               AND embedding <|{take},{KNN_EF}|> $embedding \
             ORDER BY score DESC \
             LIMIT {take};"
        );

        let mut response = self
            .db
            .query(sql)
            .bind(("embedding", embedding))
            .bind(("kb_ids", params.kb_ids.clone()))
            .await?;
        let hits: Vec<VectorHit> = response.take(0)?;

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
                match_type: MatchType::Vector,
            })
            .collect())
    }
}
