use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;

use super::{ClientIp, JsonBody, SharedState};
use crate::error::{ApiError, ApiResult};
use crate::security::phones::require_valid_phone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyAction {
    Send,
    Check,
}

impl FromStr for VerifyAction {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(VerifyAction::Send),
            "check" => Ok(VerifyAction::Check),
            other => Err(ApiError::bad_request(format!("unknown action: {other}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    action: Option<String>,
    phone_number: Option<String>,
    code: Option<String>,
}

pub async fn verify(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<VerifyRequest>,
) -> ApiResult<impl IntoResponse> {
    let phone = req
        .phone_number
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());
    if let Some(phone) = phone {
        require_valid_phone(phone)?;
    }
    let action: VerifyAction = req.action.as_deref().unwrap_or_default().parse()?;

    match action {
        VerifyAction::Send => {
            let phone = phone.ok_or_else(|| ApiError::bad_request("phone number is required"))?;
            state.check_rate(&ip, "/api/sms-verify").await?;
            if let Err(e) = state.sms.send(phone).await {
                state.audit.sms_failed(phone, &e.to_string());
                return Err(e);
            }
            state.audit.sms_sent(phone, &ip);
            Ok(Json(json!({
                "success": true,
                "message": "verification code sent",
            })))
        }
        VerifyAction::Check => {
            let code = req.code.as_deref().map(str::trim).filter(|c| !c.is_empty());
            let (Some(phone), Some(code)) = (phone, code) else {
                return Err(ApiError::bad_request(
                    "phone number and verification code are required",
                ));
            };
            state.check_rate(&ip, "/api/sms-verify").await?;
            if let Err(e) = state.sms.check(phone, code).await {
                state.audit.verification_failed(phone, &e.to_string());
                return Err(e);
            }
            Ok(Json(json!({
                "success": true,
                "message": "verification succeeded",
            })))
        }
    }
}
