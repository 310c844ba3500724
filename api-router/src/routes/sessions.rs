use axum::{
    extract::{Path, State},
    Extension, Json,
};
use common::{
    storage::types::{
        message::{Message, MessageRole},
        model::DEFAULT_CHAT_MODEL_ID,
        session::{FallbackStrategy, Session},
        tenant::Tenant,
    },
    utils::chat::{ChatMessage, ChatOptions},
};
use retrieval_engines::{hybrid_search, HybridSearchParams};
use serde::Deserialize;
use serde_json::json;

use crate::{
    api_state::ApiState,
    error::{ApiError, ApiResponse},
    routes::knowledge_bases::load_owned_kb,
};

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub kb_id: String,
    pub chat_model_id: Option<String>,
    #[serde(flatten)]
    pub overrides: SessionOverrides,
}

#[derive(Deserialize, Default)]
pub struct SessionOverrides {
    pub title: Option<String>,
    pub summary_model_id: Option<String>,
    pub embedding_top_k: Option<usize>,
    pub keyword_threshold: Option<f32>,
    pub vector_threshold: Option<f32>,
    pub rerank_top_k: Option<usize>,
    pub rerank_threshold: Option<f32>,
    pub enable_rewrite: Option<bool>,
    pub enable_neighbor_expansion: Option<bool>,
    pub fallback_strategy: Option<FallbackStrategy>,
    pub fallback_response: Option<String>,
    pub context_template: Option<String>,
    pub max_rounds: Option<usize>,
}

#[derive(Deserialize)]
pub struct KnowledgeSearchRequest {
    pub kb_id: String,
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

fn apply_overrides(session: &mut Session, overrides: SessionOverrides) {
    if overrides.title.is_some() {
        session.title = overrides.title;
    }
    if overrides.summary_model_id.is_some() {
        session.summary_model_id = overrides.summary_model_id;
    }
    if let Some(value) = overrides.embedding_top_k {
        session.embedding_top_k = value;
    }
    if let Some(value) = overrides.keyword_threshold {
        session.keyword_threshold = value;
    }
    if let Some(value) = overrides.vector_threshold {
        session.vector_threshold = value;
    }
    if let Some(value) = overrides.rerank_top_k {
        session.rerank_top_k = value;
    }
    if let Some(value) = overrides.rerank_threshold {
        session.rerank_threshold = value;
    }
    if let Some(value) = overrides.enable_rewrite {
        session.enable_rewrite = value;
    }
    if let Some(value) = overrides.enable_neighbor_expansion {
        session.enable_neighbor_expansion = value;
    }
    if let Some(value) = overrides.fallback_strategy {
        session.fallback_strategy = value;
    }
    if let Some(value) = overrides.fallback_response {
        session.fallback_response = value;
    }
    if overrides.context_template.is_some() {
        session.context_template = overrides.context_template;
    }
    if let Some(value) = overrides.max_rounds {
        session.max_rounds = value;
    }
}

pub(crate) async fn load_owned_session(
    state: &ApiState,
    tenant: &Tenant,
    session_id: &str,
) -> Result<Session, ApiError> {
    let session: Session = state
        .db
        .get_item(session_id)
        .await?
        .filter(|session: &Session| session.tenant_id == tenant.id)
        .ok_or_else(|| ApiError::NotFound(format!("session '{session_id}'")))?;
    Ok(session)
}

pub async fn create_session(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &body.kb_id).await?;

    let chat_model_id = body.chat_model_id.unwrap_or_else(|| {
        state
            .config
            .init_llm_model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL_ID.to_string())
    });

    let mut session = Session::new(tenant.id.clone(), kb.id, chat_model_id);
    apply_overrides(&mut session, body.overrides);
    state.db.store_item(session.clone()).await?;

    ApiResponse::data(session)
}

pub async fn list_sessions(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ApiResponse>, ApiError> {
    let sessions = Session::list_by_tenant(&tenant.id, &state.db).await?;
    ApiResponse::data(sessions)
}

pub async fn get_session(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let session = load_owned_session(&state, &tenant, &id).await?;
    ApiResponse::data(session)
}

pub async fn update_session(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(overrides): Json<SessionOverrides>,
) -> Result<Json<ApiResponse>, ApiError> {
    let mut session = load_owned_session(&state, &tenant, &id).await?;
    apply_overrides(&mut session, overrides);
    state.db.upsert_item(session.clone()).await?;
    ApiResponse::data(session)
}

pub async fn delete_session(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let session = load_owned_session(&state, &tenant, &id).await?;
    state.db.delete_item::<Session>(&session.id).await?;
    ApiResponse::data(json!({ "deleted": session.id }))
}

/// Summarize the session's opening exchange into a short title.
pub async fn generate_title(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let session = load_owned_session(&state, &tenant, &id).await?;

    let history = Message::load_recent(&session.id, session.max_rounds.saturating_mul(2), &state.db)
        .await?;
    let Some(first_question) = history
        .iter()
        .find(|message| message.role == MessageRole::User)
    else {
        return Err(ApiError::BadRequest(
            "session has no user message to derive a title from".into(),
        ));
    };

    let model_id = session
        .summary_model_id
        .clone()
        .unwrap_or_else(|| session.chat_model_id.clone());
    let chat = state.models.chat(&model_id).await?;

    let messages = vec![
        ChatMessage::system(
            "Summarize the user's question into a session title of at most eight words. \
             Reply with only the title.",
        ),
        ChatMessage::user(first_question.content.clone()),
    ];
    let options = ChatOptions {
        temperature: Some(0.0),
        max_tokens: Some(32),
        ..ChatOptions::default()
    };
    let response = chat.chat(&messages, &options).await?;
    let title = response.content.trim().trim_matches('"').to_owned();

    Session::set_title(&session.id, &title, &state.db).await?;
    ApiResponse::data(json!({ "id": session.id, "title": title }))
}

/// Raw hybrid retrieval, outside of any chat session.
pub async fn knowledge_search(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<KnowledgeSearchRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let kb = load_owned_kb(&state, &tenant, &body.kb_id).await?;
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
