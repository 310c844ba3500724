use axum::{
    extract::{Path, State},
    Extension, Json,
};
use common::storage::types::{chunk::Chunk, tenant::Tenant};
use serde_json::json;

use crate::{
    api_state::ApiState,
    error::{ApiError, ApiResponse},
    routes::{knowledge::load_owned_knowledge, knowledge_bases::load_owned_kb},
};

pub async fn list_chunks(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(knowledge_id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let knowledge = load_owned_knowledge(&state, &tenant, &knowledge_id).await?;
    let chunks = Chunk::list_by_knowledge(&knowledge.id, &state.db).await?;
    ApiResponse::data(chunks)
}

pub async fn delete_chunk(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path((knowledge_id, chunk_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse>, ApiError> {
    let knowledge = load_owned_knowledge(&state, &tenant, &knowledge_id).await?;
    let chunk: Chunk = state
        .db
        .get_item(&chunk_id)
        .await?
        .filter(|chunk: &Chunk| chunk.knowledge_id == knowledge.id)
        .ok_or_else(|| ApiError::NotFound(format!("chunk '{chunk_id}'")))?;

    let kb = load_owned_kb(&state, &tenant, &knowledge.kb_id).await?;
    let embedder = state.models.embedder(&kb.embedding_model_id).await?;

    let ids = vec![chunk.id.clone()];
    for engine in state.registry.unique_engines_for(&tenant.retriever_engines) {
        engine
            .delete_by_chunk_ids(&ids, embedder.dimension())
            .await?;
    }
    state.db.delete_item::<Chunk>(&chunk.id).await?;

    ApiResponse::data(json!({ "deleted": chunk.id }))
}

pub async fn delete_knowledge_chunks(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(knowledge_id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let knowledge = load_owned_knowledge(&state, &tenant, &knowledge_id).await?;
    let kb = load_owned_kb(&state, &tenant, &knowledge.kb_id).await?;
    let embedder = state.models.embedder(&kb.embedding_model_id).await?;

    let ids = vec![knowledge.id.clone()];
    for engine in state.registry.unique_engines_for(&tenant.retriever_engines) {
        engine
            .delete_by_knowledge_ids(&ids, embedder.dimension())
            .await?;
    }
    Chunk::delete_by_knowledge(&knowledge.id, &state.db).await?;

    ApiResponse::data(json!({ "deleted_knowledge": knowledge.id }))
}
