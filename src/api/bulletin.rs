use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::{AdminAuth, JsonBody, SharedState};
use crate::board::BulletinDraft;
use crate::error::ApiResult;

pub async fn list(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.bulletins.list().await?))
}

pub async fn create(
    State(state): State<SharedState>,
    _auth: AdminAuth,
    JsonBody(draft): JsonBody<BulletinDraft>,
) -> ApiResult<impl IntoResponse> {
    let id = state.bulletins.create(draft).await?;
    state.audit.bulletin_changed(&id, "created");
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

pub async fn update(
    State(state): State<SharedState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    JsonBody(draft): JsonBody<BulletinDraft>,
) -> ApiResult<impl IntoResponse> {
    state.bulletins.update(&id, draft).await?;
    state.audit.bulletin_changed(&id, "updated");
    Ok(Json(json!({ "success": true })))
}

pub async fn delete(
    State(state): State<SharedState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.bulletins.delete(&id).await?;
    state.audit.bulletin_changed(&id, "deleted");
    Ok(Json(json!({ "success": true })))
}
