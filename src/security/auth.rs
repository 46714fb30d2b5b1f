use anyhow::Result;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use crate::store::KvStore;

pub const PASSWORD_SESSION_TTL: Duration = Duration::from_secs(3600);
pub const PHONE_SESSION_TTL: Duration = Duration::from_secs(7200);

const SESSION_PREFIX: &str = "session-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    Password,
    Phone,
}

/// What a session token resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSession {
    pub method: LoginMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub created_at: i64,
}

impl AdminSession {
    pub fn password() -> Self {
        Self {
            method: LoginMethod::Password,
            phone_number: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn phone(phone_number: &str) -> Self {
        Self {
            method: LoginMethod::Phone,
            phone_number: Some(phone_number.to_string()),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    fn ttl(&self) -> Duration {
        match self.method {
            LoginMethod::Password => PASSWORD_SESSION_TTL,
            LoginMethod::Phone => PHONE_SESSION_TTL,
        }
    }
}

/// Admin sessions kept in the session namespace; expiry is the store's TTL.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(sessions: Arc<dyn KvStore>) -> Self {
        Self { sessions }
    }

    pub async fn create_session(&self, session: AdminSession) -> Result<String> {
        let session_id = format!("{SESSION_PREFIX}{}", Uuid::new_v4());
        self.sessions
            .put_json(&session_id, &session, Some(session.ttl()))
            .await?;
        debug!(method = ?session.method, "admin session created");
        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<AdminSession>> {
        if !session_id.starts_with(SESSION_PREFIX) {
            return Ok(None);
        }
        // Unreadable records count as no session rather than a server error
        match self.sessions.get_json::<AdminSession>(session_id).await {
            Ok(found) => Ok(found),
            Err(e) => {
                debug!(error = %e, "discarding unreadable session record");
                Ok(None)
            }
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        if session_id.starts_with(SESSION_PREFIX) {
            self.sessions.delete(session_id).await?;
        }
        Ok(())
    }

    pub async fn count_sessions(&self) -> Result<usize> {
        Ok(self.sessions.list(Some(SESSION_PREFIX)).await?.len())
    }
}

/// Constant-time comparison of a submitted password with the configured one.
pub fn password_matches(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1
}

/// Token from `Authorization: Bearer <token>`; a bare token is accepted too.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match raw.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ if raw.eq_ignore_ascii_case("bearer") => "",
        _ => raw,
    };
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::HeaderValue;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_session_store_create_and_get() {
        let store = store();
        let session_id = store.create_session(AdminSession::password()).await.unwrap();
        assert!(session_id.starts_with("session-"));

        let retrieved = store.get_session(&session_id).await.unwrap();
        assert_eq!(retrieved.unwrap().method, LoginMethod::Password);
    }

    #[tokio::test]
    async fn test_session_store_delete() {
        let store = store();
        let session_id = store
            .create_session(AdminSession::phone("13800138000"))
            .await
            .unwrap();
        assert!(store.get_session(&session_id).await.unwrap().is_some());

        store.delete_session(&session_id).await.unwrap();
        assert!(store.get_session(&session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_store_multiple_sessions() {
        let store = store();
        let s1 = store.create_session(AdminSession::password()).await.unwrap();
        let s2 = store
            .create_session(AdminSession::phone("13900139000"))
            .await
            .unwrap();
        assert_ne!(s1, s2);
        assert_eq!(store.count_sessions().await.unwrap(), 2);

        let phone = store.get_session(&s2).await.unwrap().unwrap();
        assert_eq!(phone.phone_number.as_deref(), Some("13900139000"));
    }

    #[tokio::test]
    async fn foreign_keys_are_not_sessions() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        kv.put("admin-sms-verified:13800138000", "verified", None)
            .await
            .unwrap();
        kv.put("session-garbage", "authenticated", None).await.unwrap();
        let store = SessionStore::new(kv);

        assert!(store
            .get_session("admin-sms-verified:13800138000")
            .await
            .unwrap()
            .is_none());
        assert!(store.get_session("session-garbage").await.unwrap().is_none());
    }

    #[test]
    fn test_password_matches() {
        assert!(password_matches("admin123", "admin123"));
        assert!(!password_matches("admin12", "admin123"));
        assert!(!password_matches("", ""));
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer session-1"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("session-1"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("session-2"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("session-2"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }
}
