use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use common::storage::types::{message::Message, tenant::Tenant};
use serde::Deserialize;
use serde_json::json;

use crate::{
    api_state::ApiState,
    error::{ApiError, ApiResponse},
    routes::sessions::load_owned_session,
};

const MAX_PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
pub struct LoadMessagesQuery {
    pub before_time: Option<String>,
    pub limit: Option<usize>,
}

/// The `limit` newest messages older than `before_time`, newest first.
pub async fn load_messages(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    Query(query): Query<LoadMessagesQuery>,
) -> Result<Json<ApiResponse>, ApiError> {
    let session = load_owned_session(&state, &tenant, &session_id).await?;

    let before_time = match query.before_time.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|err| ApiError::BadRequest(format!("invalid before_time: {err}")))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let limit = query.limit.unwrap_or(20).min(MAX_PAGE_SIZE);

    let messages = Message::load_before(&session.id, before_time, limit, &state.db).await?;
    ApiResponse::data(messages)
}

pub async fn delete_message(
    State(state): State<ApiState>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse>, ApiError> {
    let session = load_owned_session(&state, &tenant, &session_id).await?;

    let message: Message = state
        .db
        .get_item(&message_id)
        .await?
        .filter(|message: &Message| message.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("message '{message_id}'")))?;

    Message::soft_delete(&message.id, &state.db).await?;
    ApiResponse::data(json!({ "deleted": message.id }))
}
