pub mod admin;
pub mod advice;
pub mod bulletin;
pub mod legacy;
pub mod sms;

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection, ConnectInfo, FromRequest, FromRequestParts, Request, State,
    },
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS},
        request::Parts,
        HeaderValue, Method,
    },
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::board::{AdviceBoard, BulletinBoard};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::security::audit_log::AuditLogger;
use crate::security::auth::{bearer_token, password_matches, AdminSession, SessionStore};
use crate::security::phones::AuthorizedPhones;
use crate::security::rate_limit::RateLimiter;
use crate::sms::{AliyunSmsClient, SmsSender, SmsVerifier};
use crate::store::Stores;

pub type SharedState = Arc<AppState>;

pub const PUBLIC_LIST_CACHE: &str = "public, max-age=30";
const CORS_MAX_AGE: Duration = Duration::from_secs(86400);

fn client_ip(parts: &Parts) -> String {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
        if let Ok(s) = forwarded.to_str() {
            // first hop is the original client
            let ip = s.split(',').next().unwrap_or(s).trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }
    if let Some(real_ip) = parts.headers.get("x-real-ip") {
        if let Ok(s) = real_ip.to_str() {
            let ip = s.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    "127.0.0.1".to_string()
}

/// Caller address from connect info, proxy headers, or loopback.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_ip(parts)))
    }
}

/// A request carrying a live admin session in `Authorization`.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    pub session_id: String,
    pub session: AdminSession,
}

impl FromRequestParts<SharedState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers);
        let ip = client_ip(parts);
        let (session_id, session) = state
            .require_session(token.as_deref(), &ip, parts.uri.path())
            .await?;
        Ok(AdminAuth {
            session_id,
            session,
        })
    }
}

/// `Json` whose rejections render as `ApiError` bodies.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    debug!(error = %rejection.body_text(), "rejected request body");
    ApiError::bad_request(format!("invalid request body: {}", rejection.body_text()))
}

pub struct AppState {
    pub config: Arc<Config>,
    pub stores: Stores,
    pub advices: AdviceBoard,
    pub bulletins: BulletinBoard,
    pub sessions: SessionStore,
    pub phones: AuthorizedPhones,
    pub sms: SmsVerifier,
    pub rate_limiter: RateLimiter,
    pub audit: AuditLogger,
}

impl AppState {
    /// Builds stores and the SMS client from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let stores = Stores::from_config(&config).context("initialising key-value stores")?;
        let sender: Option<Arc<dyn SmsSender>> = match config.sms.clone() {
            Some(sms) => Some(Arc::new(
                AliyunSmsClient::new(sms).context("initialising SMS client")?,
            )),
            None => {
                debug!("no SMS sender configured");
                None
            }
        };
        Ok(Self::with_parts(config, stores, sender))
    }

    pub fn with_parts(
        config: Config,
        stores: Stores,
        sms_sender: Option<Arc<dyn SmsSender>>,
    ) -> Self {
        Self {
            advices: AdviceBoard::new(stores.advices.clone()),
            bulletins: BulletinBoard::new(stores.bulletins.clone()),
            sessions: SessionStore::new(stores.sessions.clone()),
            phones: AuthorizedPhones::new(
                stores.admin_config.clone(),
                config.authorized_phones.clone(),
            ),
            sms: SmsVerifier::new(stores.sessions.clone(), sms_sender),
            rate_limiter: RateLimiter::new_per_minute(config.rate_limit_per_min),
            audit: AuditLogger::new(),
            stores,
            config: Arc::new(config),
        }
    }

    /// Resolves a session token or rejects with 401.
    pub async fn require_session(
        &self,
        token: Option<&str>,
        client_ip: &str,
        path: &str,
    ) -> ApiResult<(String, AdminSession)> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            self.audit.session_rejected(client_ip, path);
            return Err(ApiError::unauthorized("unauthorized"));
        };
        match self.sessions.get_session(token).await? {
            Some(session) => Ok((token.to_string(), session)),
            None => {
                self.audit.session_rejected(client_ip, path);
                Err(ApiError::unauthorized(
                    "session expired or invalid, please log in again",
                ))
            }
        }
    }

    /// Checks the admin password used by the moderation endpoints.
    pub fn require_admin_password(
        &self,
        provided: Option<&str>,
        client_ip: &str,
        path: &str,
    ) -> ApiResult<()> {
        if password_matches(provided.unwrap_or_default(), &self.config.admin_password) {
            Ok(())
        } else {
            self.audit.password_rejected(client_ip, path);
            Err(ApiError::unauthorized("invalid password"))
        }
    }

    pub async fn check_rate(&self, client_ip: &str, path: &str) -> ApiResult<()> {
        match self.rate_limiter.check(client_ip).await {
            Ok(()) => Ok(()),
            Err(wait) => {
                self.audit.rate_limited(client_ip, path);
                Err(ApiError::TooManyRequests(format!(
                    "too many requests, retry in {}s",
                    wait.as_secs().max(1)
                )))
            }
        }
    }
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "store": state.stores.advices.backend_name(),
    }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(CORS_MAX_AGE)
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/advice", get(advice::list).post(advice::create))
        .route(
            "/api/advice/{id}",
            put(advice::update).delete(advice::delete),
        )
        .route("/api/advice-comment", post(advice::comment))
        .route(
            "/api/advice-admin",
            get(advice::admin_list).post(advice::admin_action),
        )
        .route("/api/list", get(legacy::list_approved))
        .route("/api/list-all", get(legacy::list_all))
        .route("/api/admin-list", get(legacy::admin_list))
        .route("/api/approve", post(legacy::approve))
        .route("/api/delete", post(legacy::delete))
        .route("/api/bulletin", get(bulletin::list).post(bulletin::create))
        .route(
            "/api/bulletin/{id}",
            put(bulletin::update).delete(bulletin::delete),
        )
        .route("/api/admin-auth", post(admin::password_login))
        .route("/api/admin-auth-check", post(admin::session_check))
        .route("/api/admin-logout", post(admin::logout))
        .route("/api/admin-phone-auth", post(admin::phone_login))
        .route("/api/admin-phone-list", get(admin::phone_list))
        .route("/api/admin-phone-manage", post(admin::phone_manage))
        .route(
            "/api/admin-debug",
            get(admin::debug_report).post(admin::debug_session),
        )
        .route("/api/sms-verify", post(sms::verify))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(cors_layer())
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("received SIGTERM, shutting down");
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;
    info!("HTTP server stopped");
    Ok(())
}
