use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use super::{AdminAuth, ClientIp, JsonBody, SharedState};
use crate::config::DEFAULT_ADMIN_PASSWORD;
use crate::error::{ApiError, ApiResult};
use crate::security::auth::{bearer_token, password_matches, AdminSession, LoginMethod};
use crate::security::phones::require_valid_phone;

#[derive(Debug, Deserialize)]
pub struct PasswordLogin {
    password: Option<String>,
}

pub async fn password_login(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<PasswordLogin>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&ip, "/api/admin-auth").await?;
    let password = req.password.unwrap_or_default();
    if password.is_empty() {
        return Err(ApiError::bad_request("password is required"));
    }
    if !password_matches(&password, state.config.bulletin_password()) {
        state
            .audit
            .login_failure(LoginMethod::Password, &ip, "wrong password");
        return Err(ApiError::unauthorized("wrong password"));
    }

    let session_id = state.sessions.create_session(AdminSession::password()).await?;
    state.audit.login_success(LoginMethod::Password, &ip, None);
    Ok(Json(json!({ "success": true, "sessionId": session_id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    session_id: Option<String>,
}

/// Body `sessionId` first, then the `Authorization` header.
fn session_token(body: Option<String>, headers: &HeaderMap) -> Option<String> {
    body.filter(|s| !s.trim().is_empty())
        .or_else(|| bearer_token(headers))
}

pub async fn session_check(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    JsonBody(req): JsonBody<SessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let token = session_token(req.session_id, &headers);
    let (_, session) = state
        .require_session(token.as_deref(), &ip, "/api/admin-auth-check")
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "session valid",
        "method": session.method,
        "phoneNumber": session.phone_number,
    })))
}

pub async fn logout(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    auth: AdminAuth,
) -> ApiResult<impl IntoResponse> {
    state.sessions.delete_session(&auth.session_id).await?;
    state.audit.logout(&ip);
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneAuthAction {
    /// Exchange a fresh SMS verification for a session.
    Check,
    /// Verify a code without going through `/api/sms-verify`.
    VerifySms,
}

impl FromStr for PhoneAuthAction {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check" => Ok(PhoneAuthAction::Check),
            "verify-sms" => Ok(PhoneAuthAction::VerifySms),
            other => Err(ApiError::bad_request(format!("unknown action: {other}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneAuthRequest {
    action: Option<String>,
    phone_number: Option<String>,
    code: Option<String>,
}

fn required_phone(phone: Option<&str>) -> ApiResult<String> {
    let phone = phone
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("phone number is required"))?;
    require_valid_phone(phone)?;
    Ok(phone.to_string())
}

pub async fn phone_login(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<PhoneAuthRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&ip, "/api/admin-phone-auth").await?;
    let phone = required_phone(req.phone_number.as_deref())?;
    let action: PhoneAuthAction = req.action.as_deref().unwrap_or_default().parse()?;

    match action {
        PhoneAuthAction::Check => {
            if !state.phones.contains(&phone).await? {
                state
                    .audit
                    .login_failure(LoginMethod::Phone, &ip, "phone not authorized");
                return Err(ApiError::Forbidden {
                    message: "this phone number is not authorized for administration".into(),
                    code: Some("UNAUTHORIZED_PHONE"),
                });
            }
            if !state.sms.take_admin_verified(&phone).await? {
                state
                    .audit
                    .login_failure(LoginMethod::Phone, &ip, "sms not verified");
                return Err(ApiError::Unauthorized {
                    message: "complete SMS verification first".into(),
                    code: Some("SMS_NOT_VERIFIED"),
                });
            }

            let session_id = state.sessions.create_session(AdminSession::phone(&phone)).await?;
            state.audit.login_success(LoginMethod::Phone, &ip, Some(&phone));
            Ok(Json(json!({
                "success": true,
                "sessionId": session_id,
                "message": "administrator verified",
            })))
        }
        PhoneAuthAction::VerifySms => {
            let code = req
                .code
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| ApiError::bad_request("verification code is required"))?;
            if let Err(e) = state.sms.check(&phone, code).await {
                state.audit.verification_failed(&phone, &e.to_string());
                return Err(e);
            }
            Ok(Json(json!({
                "success": true,
                "message": "SMS verification recorded",
            })))
        }
    }
}

pub async fn phone_list(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let phones = state.phones.list().await?;
    Ok(Json(json!({
        "success": true,
        "count": phones.len(),
        "phones": phones,
    })))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneManageAction {
    Add,
    Delete,
}

impl FromStr for PhoneManageAction {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(PhoneManageAction::Add),
            "delete" => Ok(PhoneManageAction::Delete),
            other => Err(ApiError::bad_request(format!("unknown action: {other}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneManageRequest {
    action: Option<String>,
    phone_number: Option<String>,
    session_id: Option<String>,
}

pub async fn phone_manage(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    JsonBody(req): JsonBody<PhoneManageRequest>,
) -> ApiResult<impl IntoResponse> {
    let token = session_token(req.session_id, &headers);
    state
        .require_session(token.as_deref(), &ip, "/api/admin-phone-manage")
        .await?;

    let phone = required_phone(req.phone_number.as_deref())?;
    let action: PhoneManageAction = req.action.as_deref().unwrap_or_default().parse()?;

    let (current, message, verb) = match action {
        PhoneManageAction::Add => (state.phones.add(&phone).await?, "phone number added", "added"),
        PhoneManageAction::Delete => (
            state.phones.remove(&phone).await?,
            "phone number removed",
            "removed",
        ),
    };
    state.audit.phone_list_changed(&phone, verb, current.len());
    Ok(Json(json!({
        "success": true,
        "message": message,
        "phoneNumber": phone,
        "currentList": current,
    })))
}

fn set_or_unset(present: bool) -> &'static str {
    if present {
        "set"
    } else {
        "unset"
    }
}

const PROBE_TTL: Duration = Duration::from_secs(60);

/// Configuration and storage health for an administrator.
pub async fn debug_report(
    State(state): State<SharedState>,
    _auth: AdminAuth,
) -> ApiResult<impl IntoResponse> {
    let config = &state.config;
    let admin_password = if config.admin_password == DEFAULT_ADMIN_PASSWORD {
        "default"
    } else {
        "set"
    };
    let sms = match &config.sms {
        Some(sms) => json!({
            "configured": true,
            "accessKeyId": set_or_unset(!sms.access_key_id.is_empty()),
            "accessKeySecret": set_or_unset(!sms.access_key_secret.is_empty()),
            "signName": sms.sign_name,
            "templateCode": sms.template_code,
            "endpoint": sms.endpoint,
            "signatureVersion": sms.signature_version,
        }),
        None => json!({ "configured": false }),
    };

    let current_phones: Value = match state.phones.list().await {
        Ok(phones) => json!(phones),
        Err(e) => json!(format!("error: {e:#}")),
    };
    let active_sessions: Value = match state.sessions.count_sessions().await {
        Ok(n) => json!(n),
        Err(e) => json!(format!("error: {e:#}")),
    };

    let probe_key = format!("debug-probe-{}", Utc::now().timestamp_millis());
    let admin_config = &state.stores.admin_config;
    let write_test = match admin_config.put(&probe_key, "probe", Some(PROBE_TTL)).await {
        Ok(()) => match admin_config.delete(&probe_key).await {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("delete failed: {e:#}"),
        },
        Err(e) => format!("write failed: {e:#}"),
    };
    if write_test != "ok" {
        warn!(result = %write_test, "admin config write probe failed");
    }

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": crate::VERSION,
        "store": admin_config.backend_name(),
        "config": {
            "adminPassword": admin_password,
            "bulletinPassword": set_or_unset(config.bulletin_password.is_some()),
            "authorizedPhones": config.authorized_phones.len(),
            "rateLimitPerMin": config.rate_limit_per_min,
            "sms": sms,
        },
        "currentPhones": current_phones,
        "activeSessions": active_sessions,
        "writeTest": write_test,
    })))
}

/// Reports whether a session ID is live, without requiring one.
pub async fn debug_session(
    State(state): State<SharedState>,
    JsonBody(req): JsonBody<SessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = match req.session_id.as_deref() {
        Some(id) if !id.trim().is_empty() => state.sessions.get_session(id.trim()).await?,
        _ => None,
    };
    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "sessionProvided": req.session_id.is_some(),
        "sessionValid": session.is_some(),
        "method": session.map(|s| s.method),
    })))
}
