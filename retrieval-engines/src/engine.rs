use std::collections::HashMap;

use async_trait::async_trait;
use common::{
    error::AppError,
    retrieval::{MatchType, RetrieverType},
};
use serde::{Deserialize, Serialize};

/// One chunk's payload for a single engine's index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub kb_id: String,
    pub knowledge_id: String,
    pub chunk_index: u32,
    pub content: String,
    /// Present for vector engines; keyword engines ignore it.
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct RetrieveParams {
    pub query: String,
    pub query_embedding: Option<Vec<f32>>,
    pub kb_ids: Vec<String>,
    pub top_k: usize,
    pub threshold: f32,
    pub retriever_type: RetrieverType,
}

/// Retrieval hit with enough of a chunk snapshot to build prompts from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrieveResult {
    pub chunk_id: String,
    pub kb_id: String,
    pub knowledge_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub score: f32,
    pub match_type: MatchType,
}

/// A pluggable per-backend index. Implementations are registered by driver
/// name in the [`crate::registry::EngineRegistry`] at startup.
#[async_trait]
pub trait RetrievalEngine: Send + Sync {
    fn engine_type(&self) -> &'static str;

    fn supports(&self) -> &[RetrieverType];

    /// Idempotent on chunk-id.
    async fn save(&self, entry: &IndexEntry) -> Result<(), AppError>;

    /// Idempotent on chunk-id for every entry.
    async fn batch_save(&self, entries: &[IndexEntry]) -> Result<(), AppError>;

    async fn delete_by_chunk_ids(
        &self,
        chunk_ids: &[String],
        dimension: usize,
    ) -> Result<(), AppError>;

    async fn delete_by_knowledge_ids(
        &self,
        knowledge_ids: &[String],
        dimension: usize,
    ) -> Result<(), AppError>;

    /// Duplicate the index payload of `src_kb_id` under new chunk/knowledge
    /// ids without recomputing embeddings.
    async fn copy_indices(
        &self,
        src_kb_id: &str,
        dst_kb_id: &str,
        chunk_id_map: &HashMap<String, String>,
        knowledge_id_map: &HashMap<String, String>,
        dimension: usize,
    ) -> Result<(), AppError>;

    /// Up to `top_k` results already filtered by the params' threshold,
    /// ordered by descending engine-local score.
    async fn retrieve(&self, params: &RetrieveParams) -> Result<Vec<RetrieveResult>, AppError>;
}
