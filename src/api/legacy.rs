//! Older moderation endpoints kept for existing admin pages.

use axum::{
    extract::{Query, State},
    http::header::CACHE_CONTROL,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::advice::PasswordQuery;
use super::{ClientIp, JsonBody, SharedState, PUBLIC_LIST_CACHE};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct IdWithPassword {
    id: Option<String>,
    password: Option<String>,
}

impl IdWithPassword {
    fn id(&self) -> ApiResult<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::bad_request("id is required"))
    }
}

pub async fn list_approved(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let advices = state.advices.list_approved().await?;
    Ok(([(CACHE_CONTROL, PUBLIC_LIST_CACHE)], Json(advices)))
}

pub async fn list_all(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.advices.list_all().await?))
}

pub async fn admin_list(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    Query(query): Query<PasswordQuery>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin_password(query.password.as_deref(), &ip, "/api/admin-list")?;
    Ok(Json(state.advices.list_all().await?))
}

pub async fn approve(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<IdWithPassword>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin_password(req.password.as_deref(), &ip, "/api/approve")?;
    let id = req.id()?;
    state.advices.approve(id).await?;
    state.audit.advice_changed(id, "approved");
    Ok(Json(json!({ "success": true })))
}

pub async fn delete(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<IdWithPassword>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin_password(req.password.as_deref(), &ip, "/api/delete")?;
    let id = req.id()?;
    state.advices.remove(id).await?;
    state.audit.advice_changed(id, "deleted");
    Ok(Json(json!({ "success": true })))
}
