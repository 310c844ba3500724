use axum::{
    extract::{Path, State},
    Extension, Json,
};
use common::{retrieval::RetrieverEngineChoice, storage::types::tenant::Tenant};
use retrieval_engines::registry::default_choices_for_drivers;
use serde::Deserialize;

use crate::{
    api_state::ApiState,
    error::{ApiError, ApiResponse},
};

#[derive(Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    #[serde(default)]
    pub retriever_engines: Vec<RetrieverEngineChoice>,
    #[serde(default = "default_storage_quota")]
    pub storage_quota: i64,
}

fn default_storage_quota() -> i64 {
    10 * 1024 * 1024 * 1024
}

#[derive(Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub retriever_engines: Option<Vec<RetrieverEngineChoice>>,
    pub storage_quota: Option<i64>,
}

pub async fn create_tenant(
    State(state): State<ApiState>,
    Json(body): Json<CreateTenantRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("tenant name must not be empty".into()));
    }

    let retriever_engines = if body.retriever_engines.is_empty() {
        default_choices_for_drivers(&state.config.retrieve_drivers())
    } else {
        body.retriever_engines
    };

    let id = Tenant::next_id(&state.db).await?;
    let tenant = Tenant::new(id, body.name, retriever_engines, body.storage_quota);
    state.db.store_item(tenant.clone()).await?;

    ApiResponse::data(tenant)
}

pub async fn list_tenants(
    State(state): State<ApiState>,
) -> Result<Json<ApiResponse>, ApiError> {
    let mut tenants: Vec<Tenant> = state.db.get_all_stored_items().await?;
    tenants.sort_by_key(|tenant| tenant.id.parse::<u32>().unwrap_or(u32::MAX));
    ApiResponse::data(tenants)
}

pub async fn get_tenant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let tenant: Tenant = state
        .db
        .get_item(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tenant '{id}'")))?;
    ApiResponse::data(tenant)
}

/// Updating a tenant always rotates its api-key.
pub async fn update_tenant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTenantRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let mut tenant: Tenant = state
        .db
        .get_item(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tenant '{id}'")))?;

    if let Some(name) = body.name {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("tenant name must not be empty".into()));
        }
        tenant.name = name;
    }
    if let Some(engines) = body.retriever_engines {
        tenant.retriever_engines = engines;
    }
    if let Some(quota) = body.storage_quota {
        tenant.storage_quota = quota;
    }
    tenant.rotate_api_key();

    state
        .db
        .upsert_item(tenant.clone())
        .await?;
    ApiResponse::data(tenant)
}

pub async fn delete_tenant(
    State(state): State<ApiState>,
    Extension(_caller): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let deleted = state
        .db
        .delete_item::<Tenant>(&id)
        .await?;
    if deleted.is_none() {
        return Err(ApiError::NotFound(format!("tenant '{id}'")));
    }
    ApiResponse::data(serde_json::json!({ "deleted": id }))
}
