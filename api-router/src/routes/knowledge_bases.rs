use axum::{
    extract::{Path, State},
    Extension, Json,
};
use common::storage::types::{
    knowledge::Knowledge,
    knowledge_base::{ChunkingConfig, KnowledgeBase},
    model::{DEFAULT_CHAT_MODEL_ID, DEFAULT_EMBEDDING_MODEL_ID},
    tenant::Tenant,
};
use retrieval_engines::{hybrid_search, HybridSearchParams};
use serde::Deserialize;
use serde_json::json;

use crate::{
    api_state::ApiState,
    error::{ApiError, ApiResponse},
};

#[derive(Deserialize)]
pub struct CreateKnowledgeBaseRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chunking_config: Option<ChunkingConfig>,
    pub embedding_model_id: Option<String>,
    pub summary_model_id: Option<String>,
    pub rerank_model_id: Option<String>,
    pub vlm_model_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateKnowledgeBaseRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub chunking_config: Option<ChunkingConfig>,
    pub embedding_model_id: Option<String>,
    pub summary_model_id: Option<String>,
    pub rerank_model_id: Option<Option<String>>,
    pub vlm_model_id: Option<Option<String>>,
}

#[derive(Deserialize)]
pub struct HybridSearchRequest {
    pub query_text: String,
    #[serde(default)]
    pub vector_threshold: f32,
    #[serde(default)]
    pub keyword_threshold: f32,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
}

fn default_match_count() -> usize {
    10
}

#[derive(Deserialize)]
pub struct CopyKnowledgeBaseRequest {
    pub source_kb_id: String,
    pub name: Option<String>,
}

pub(crate) async fn load_owned_kb(
    state: &ApiState,
    tenant: &Tenant,
    kb_id: &str,
) -> Result<KnowledgeBase, ApiError> {
    let kb: KnowledgeBase = state
        .db
        .get_item(kb_id)
        .await?
        .filter(|kb: &KnowledgeBase| kb.tenant_id == tenant.id)
        .ok_or_else(|| ApiError::NotFound(format!("knowledge base '{kb_id}'")))?;
    Ok(kb)
}

pub async fn create_knowledge_base(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<CreateKnowledgeBaseRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "knowledge base name must not be empty".into(),
        ));
    }

    let chunking_config = body.chunking_config.unwrap_or_default();
    chunking_config.validate()?;

    let embedding_model_id = body.embedding_model_id.unwrap_or_else(|| {
        state
            .config
            .init_embedding_model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL_ID.to_string())
    });
    let summary_model_id = body.summary_model_id.unwrap_or_else(|| {
        state
            .config
            .init_llm_model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL_ID.to_string())
    });

    let kb = KnowledgeBase::new(
        tenant.id.clone(),
        body.name,
        body.description,
        chunking_config,
        embedding_model_id,
        summary_model_id,
        body.rerank_model_id,
        body.vlm_model_id,
    );
    state.db.store_item(kb.clone()).await?;

    ApiResponse::data(kb)
}

pub async fn list_knowledge_bases(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kbs = KnowledgeBase::list_by_tenant(&tenant.id, &state.db).await?;
    ApiResponse::data(kbs)
}

pub async fn get_knowledge_base(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &id).await?;
    ApiResponse::data(kb)
}

pub async fn update_knowledge_base(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(body): Json<UpdateKnowledgeBaseRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let mut kb = load_owned_kb(&state, &tenant, &id).await?;

    if let Some(embedding_model_id) = body.embedding_model_id {
        if embedding_model_id != kb.embedding_model_id && kb.has_knowledge(&state.db).await? {
            return Err(ApiError::BadRequest(
                "embedding model cannot change once the knowledge base holds documents".into(),
            ));
        }
        kb.embedding_model_id = embedding_model_id;
    }
    if let Some(name) = body.name {
        kb.name = name;
    }
    if let Some(description) = body.description {
        kb.description = description;
    }
    if let Some(chunking_config) = body.chunking_config {
        chunking_config.validate()?;
        kb.chunking_config = chunking_config;
    }
    if let Some(summary_model_id) = body.summary_model_id {
        kb.summary_model_id = summary_model_id;
    }
    if let Some(rerank_model_id) = body.rerank_model_id {
        kb.rerank_model_id = rerank_model_id;
    }
    if let Some(vlm_model_id) = body.vlm_model_id {
        kb.vlm_model_id = vlm_model_id;
    }

    state.db.upsert_item(kb.clone()).await?;
    ApiResponse::data(kb)
}

pub async fn delete_knowledge_base(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &id).await?;
    let embedder = state.models.embedder(&kb.embedding_model_id).await?;

    let knowledge_items = Knowledge::list_by_kb(&kb.id, &state.db).await?;
    for knowledge in &knowledge_items {
        state
            .ingestion
            .delete_knowledge(&tenant, knowledge, embedder.dimension())
            .await?;
    }
    state.db.delete_item::<KnowledgeBase>(&kb.id).await?;

    ApiResponse::data(json!({ "deleted": kb.id, "documents": knowledge_items.len() }))
}

pub async fn hybrid_search_knowledge_base(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(body): Json<HybridSearchRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &id).await?;
    let embedder = state.models.embedder(&kb.embedding_model_id).await?;

    let results = hybrid_search(
        &state.registry,
        Some(&*embedder),
        &tenant.retriever_engines,
        HybridSearchParams {
            kb_id: kb.id,
            query: body.query_text,
            query_embedding: None,
            vector_threshold: body.vector_threshold,
            keyword_threshold: body.keyword_threshold,
            match_count: body.match_count,
        },
    )
    .await?;

    ApiResponse::data(results)
}

/// Clone a knowledge base, duplicating documents, chunks and index payloads
/// without recomputing any embedding.
pub async fn copy_knowledge_base(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<CopyKnowledgeBaseRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let src_kb = load_owned_kb(&state, &tenant, &body.source_kb_id).await?;
    let embedder = state.models.embedder(&src_kb.embedding_model_id).await?;

    let mut dst_kb = KnowledgeBase::new(
        tenant.id.clone(),
        body.name
            .unwrap_or_else(|| format!("{} (copy)", src_kb.name)),
        src_kb.description.clone(),
        src_kb.chunking_config.clone(),
        src_kb.embedding_model_id.clone(),
        src_kb.summary_model_id.clone(),
        src_kb.rerank_model_id.clone(),
        src_kb.vlm_model_id.clone(),
    );
    dst_kb.object_storage = src_kb.object_storage.clone();
    state.db.store_item(dst_kb.clone()).await?;

    let chunk_id_map = state
        .ingestion
        .copy_knowledge_base(&tenant, &src_kb, &dst_kb, embedder.dimension())
        .await?;

    ApiResponse::data(json!({
        "knowledge_base": dst_kb,
        "copied_chunks": chunk_id_map.len(),
        "chunk_id_map": chunk_id_map,
    }))
}
