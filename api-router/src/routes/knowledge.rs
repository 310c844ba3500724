use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::header,
    response::Response,
    Extension, Json,
};
use common::storage::types::{
    knowledge::{Knowledge, KnowledgeSource},
    knowledge_base::KnowledgeBase,
    model::AiModel,
    tenant::Tenant,
};
use ingestion_pipeline::docreader::VlmConfig;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::{
    api_state::ApiState,
    error::{ApiError, ApiResponse},
    routes::knowledge_bases::load_owned_kb,
};

#[derive(Deserialize)]
pub struct UploadUrlRequest {
    pub url: String,
    #[serde(default)]
    pub enable_multimodel: Option<bool>,
}

#[derive(Deserialize)]
pub struct BatchQuery {
    pub ids: String,
}

pub(crate) async fn load_owned_knowledge(
    state: &ApiState,
    tenant: &Tenant,
    knowledge_id: &str,
) -> Result<Knowledge, ApiError> {
    let knowledge: Knowledge = state
        .db
        .get_item(knowledge_id)
        .await?
        .filter(|knowledge: &Knowledge| knowledge.tenant_id == tenant.id)
        .ok_or_else(|| ApiError::NotFound(format!("knowledge '{knowledge_id}'")))?;
    Ok(knowledge)
}

async fn vlm_config_for(state: &ApiState, kb: &KnowledgeBase) -> Option<VlmConfig> {
    let model_id = kb.vlm_model_id.as_deref()?;
    match AiModel::require(model_id, &state.db).await {
        Ok(model) => Some(VlmConfig {
            model_name: model.name,
            base_url: model.base_url,
            api_key: model.api_key,
        }),
        Err(err) => {
            error!(error = %err, model_id, "VLM model missing; ingesting without it");
            None
        }
    }
}

/// Checks quota and content-hash uniqueness, stores the knowledge record,
/// then drives ingestion in the background.
async fn admit_knowledge(
    state: &ApiState,
    tenant: &Tenant,
    kb: &KnowledgeBase,
    mut knowledge: Knowledge,
    enable_multimodal: Option<bool>,
) -> Result<Knowledge, ApiError> {
    if tenant.storage_quota > 0
        && tenant.storage_used.saturating_add(knowledge.file_size) > tenant.storage_quota
    {
        return Err(ApiError::BadRequest("storage quota exceeded".into()));
    }

    if Knowledge::find_by_hash(&kb.id, &knowledge.content_hash, &state.db)
        .await?
        .is_some()
    {
        return Err(ApiError::Duplicate(
            "a document with identical content already exists in this knowledge base".into(),
        ));
    }

    knowledge.tenant_id = tenant.id.clone();
    state.db.store_item(knowledge.clone()).await?;

    let embedder = state.models.embedder(&kb.embedding_model_id).await?;
    let vlm = vlm_config_for(state, kb).await;

    let ingestion = Arc::clone(&state.ingestion);
    let tenant = tenant.clone();
    let mut kb = kb.clone();
    if let Some(enable) = enable_multimodal {
        kb.chunking_config.enable_multimodal = enable;
    }
    let spawned_knowledge = knowledge.clone();
    tokio::spawn(async move {
        if let Err(err) = ingestion
            .ingest(&tenant, &kb, &embedder, &spawned_knowledge, vlm)
            .await
        {
            error!(
                knowledge_id = %spawned_knowledge.id,
                error = %err,
                "Background ingestion failed"
            );
        }
    });

    Ok(knowledge)
}

pub async fn upload_knowledge_file(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(kb_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &kb_id).await?;

    let mut file_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut enable_multimodal: Option<bool> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("file") => {
                file_name = field.file_name().map(str::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("failed to read file: {err}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("enable_multimodel") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("invalid field: {err}")))?;
                enable_multimodal = Some(matches!(text.as_str(), "true" | "1" | "on"));
            }
            _ => {}
        }
    }

    let file_name =
        file_name.ok_or_else(|| ApiError::BadRequest("multipart field 'file' is required".into()))?;
    let bytes = file_bytes
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| ApiError::BadRequest("uploaded file is empty".into()))?;

    let file_type = std::path::Path::new(&file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin")
        .to_ascii_lowercase();

    let mut knowledge = Knowledge::new(
        kb.id.clone(),
        tenant.id.clone(),
        KnowledgeSource::File { file_name },
        Knowledge::content_hash_of(&bytes),
        file_type,
        bytes.len() as i64,
    );
    knowledge.raw_content = Some(bytes);

    let knowledge = admit_knowledge(&state, &tenant, &kb, knowledge, enable_multimodal).await?;
    ApiResponse::data(knowledge)
}

pub async fn upload_knowledge_url(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(kb_id): Path<String>,
    Json(body): Json<UploadUrlRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &kb_id).await?;

    let parsed = url::Url::parse(&body.url)
        .map_err(|err| ApiError::BadRequest(format!("invalid url: {err}")))?;

    let knowledge = Knowledge::new(
        kb.id.clone(),
        tenant.id.clone(),
        KnowledgeSource::Url {
            url: parsed.to_string(),
        },
        Knowledge::content_hash_of(parsed.as_str().as_bytes()),
        "url".to_string(),
        0,
    );

    let knowledge =
        admit_knowledge(&state, &tenant, &kb, knowledge, body.enable_multimodel).await?;
    ApiResponse::data(knowledge)
}

pub async fn list_knowledge(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(kb_id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &kb_id).await?;
    let items = Knowledge::list_by_kb(&kb.id, &state.db).await?;
    // Raw bytes stay server-side.
    let items: Vec<serde_json::Value> = items.into_iter().map(knowledge_summary).collect();
    ApiResponse::data(items)
}

pub async fn get_knowledge(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let knowledge = load_owned_knowledge(&state, &tenant, &id).await?;
    ApiResponse::data(knowledge_summary(knowledge))
}

pub async fn get_knowledge_batch(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<ApiResponse>, ApiError> {
    let ids: Vec<String> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect();
    if ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".into()));
    }

    let items = Knowledge::get_many(ids, &state.db).await?;
    let items: Vec<serde_json::Value> = items
        .into_iter()
        .filter(|knowledge| knowledge.tenant_id == tenant.id)
        .map(knowledge_summary)
        .collect();
    ApiResponse::data(items)
}

pub async fn delete_knowledge(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let knowledge = load_owned_knowledge(&state, &tenant, &id).await?;
    let kb = load_owned_kb(&state, &tenant, &knowledge.kb_id).await?;
    let embedder = state.models.embedder(&kb.embedding_model_id).await?;

    state
        .ingestion
        .delete_knowledge(&tenant, &knowledge, embedder.dimension())
        .await?;

    ApiResponse::data(json!({ "deleted": knowledge.id }))
}

pub async fn download_knowledge(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let knowledge = load_owned_knowledge(&state, &tenant, &id).await?;

    let Some(bytes) = knowledge.raw_content else {
        return Err(ApiError::NotFound(
            "no stored content for this knowledge".into(),
        ));
    };

    let file_name = knowledge.source.label().to_owned();
    let mime = mime_guess::from_path(&file_name).first_or_octet_stream();

    Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from(bytes))
        .map_err(|err| {
            error!(error = %err, "Failed to build download response");
            ApiError::Internal
        })
}

fn knowledge_summary(knowledge: Knowledge) -> serde_json::Value {
    json!({
        "id": knowledge.id,
        "kb_id": knowledge.kb_id,
        "tenant_id": knowledge.tenant_id,
        "source": knowledge.source,
        "content_hash": knowledge.content_hash,
        "file_type": knowledge.file_type,
        "file_size": knowledge.file_size,
        "status": knowledge.status,
        "error_message": knowledge.error_message,
        "created_at": knowledge.created_at,
        "updated_at": knowledge.updated_at,
    })
}
