use axum::{
    extract::{Path, Query, State},
    http::{header::CACHE_CONTROL, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;

use super::{AdminAuth, ClientIp, JsonBody, SharedState, PUBLIC_LIST_CACHE};
use crate::board::{AdvicePatch, AdviceSubmission};
use crate::error::{ApiError, ApiResult};

pub async fn list(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let advices = state.advices.list_all().await?;
    Ok(([(CACHE_CONTROL, PUBLIC_LIST_CACHE)], Json(advices)))
}

pub async fn create(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(submission): JsonBody<AdviceSubmission>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&ip, "/api/advice").await?;
    let id = state.advices.create(submission).await?;
    state.audit.advice_changed(&id, "submitted");
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

pub async fn update(
    State(state): State<SharedState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    JsonBody(patch): JsonBody<AdvicePatch>,
) -> ApiResult<impl IntoResponse> {
    let advice = state.advices.update(&id, patch).await?;
    state.audit.advice_changed(&id, "updated");
    Ok(Json(json!({ "success": true, "advice": advice })))
}

pub async fn delete(
    State(state): State<SharedState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.advices.delete(&id).await?;
    state.audit.advice_changed(&id, "deleted");
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRequest {
    advice_id: Option<String>,
    author: Option<String>,
    content: Option<String>,
}

pub async fn comment(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<CommentRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&ip, "/api/advice-comment").await?;
    let comment = state
        .advices
        .add_comment(
            req.advice_id.as_deref(),
            req.author.as_deref(),
            req.content.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "success": true, "comment": comment })))
}

#[derive(Debug, Deserialize)]
pub struct PasswordQuery {
    pub password: Option<String>,
}

pub async fn admin_list(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    Query(query): Query<PasswordQuery>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin_password(query.password.as_deref(), &ip, "/api/advice-admin")?;
    Ok(Json(state.advices.list_all().await?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationAction {
    Approve,
    Delete,
    Reply,
}

impl FromStr for ModerationAction {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ModerationAction::Approve),
            "delete" => Ok(ModerationAction::Delete),
            "reply" => Ok(ModerationAction::Reply),
            other => Err(ApiError::bad_request(format!("unknown action: {other}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ModerationRequest {
    id: Option<String>,
    password: Option<String>,
    action: Option<String>,
    reply: Option<String>,
}

pub async fn admin_action(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<ModerationRequest>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin_password(req.password.as_deref(), &ip, "/api/advice-admin")?;

    let action: ModerationAction = req.action.as_deref().unwrap_or_default().parse()?;
    let id = req
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("id is required"))?;

    let message = match action {
        ModerationAction::Approve => {
            state.advices.approve(id).await?;
            state.audit.advice_changed(id, "approved");
            "advice approved"
        }
        ModerationAction::Delete => {
            state.advices.remove(id).await?;
            state.audit.advice_changed(id, "deleted");
            "advice deleted"
        }
        ModerationAction::Reply => {
            state.advices.reply(id, req.reply.as_deref()).await?;
            state.audit.advice_changed(id, "replied");
            "reply saved"
        }
    };
    Ok(Json(json!({ "success": true, "message": message })))
}
