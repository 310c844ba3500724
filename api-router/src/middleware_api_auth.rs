use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use common::storage::types::tenant::Tenant;

use crate::{api_state::ApiState, error::ApiError};

/// Resolves `X-API-Key` to a tenant and attaches it to the request.
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = extract_api_key(&request)
        .ok_or_else(|| ApiError::Unauthorized("You have to be authenticated".to_string()))?;

    let tenant = Tenant::find_by_api_key(&api_key, &state.db).await?;
    let tenant =
        tenant.ok_or_else(|| ApiError::Unauthorized("You have to be authenticated".to_string()))?;

    request.extensions_mut().insert(tenant);

    Ok(next.run(request).await)
}

fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        })
        .map(String::from)
}

/// Request-id: the caller's `X-Request-ID` when present, a fresh uuid
/// otherwise.
pub fn request_id_from(request_header: Option<&str>, body_value: Option<&str>) -> String {
    body_value
        .or(request_header)
        .filter(|value| !value.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
