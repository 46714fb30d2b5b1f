pub mod aliyun;
pub mod signer;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::store::KvStore;

pub use aliyun::AliyunSmsClient;

pub const CODE_TTL: Duration = Duration::from_secs(300);
pub const RESEND_INTERVAL: Duration = Duration::from_secs(60);
pub const ADMIN_VERIFIED_TTL: Duration = Duration::from_secs(300);
/// Wrong guesses allowed before a code is discarded.
pub const MAX_CHECK_ATTEMPTS: u32 = 5;

/// Delivers a verification code to a phone.
#[async_trait]
pub trait SmsSender: Send + Sync + 'static {
    async fn send_code(&self, phone: &str, code: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRecord {
    pub code: String,
    pub phone_number: String,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub failed_attempts: u32,
}

fn code_key(phone: &str) -> String {
    format!("sms-verify:{phone}")
}

fn rate_key(phone: &str) -> String {
    format!("sms-rate:{phone}")
}

fn admin_verified_key(phone: &str) -> String {
    format!("admin-sms-verified:{phone}")
}

fn too_many_attempts() -> ApiError {
    ApiError::bad_request("too many incorrect attempts, request a new code")
}

pub fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

/// Issues and checks one-time SMS codes. State lives in the session namespace.
#[derive(Clone)]
pub struct SmsVerifier {
    state: Arc<dyn KvStore>,
    sender: Option<Arc<dyn SmsSender>>,
}

impl SmsVerifier {
    pub fn new(state: Arc<dyn KvStore>, sender: Option<Arc<dyn SmsSender>>) -> Self {
        Self { state, sender }
    }

    pub fn is_configured(&self) -> bool {
        self.sender.is_some()
    }

    pub async fn send(&self, phone: &str) -> ApiResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ApiError::Unavailable("SMS service is not configured".into()))?;

        let now_ms = Utc::now().timestamp_millis();
        if let Some(last) = self.state.get(&rate_key(phone)).await? {
            let last_ms: i64 = last.trim().parse().unwrap_or(0);
            if now_ms - last_ms < RESEND_INTERVAL.as_millis() as i64 {
                return Err(ApiError::TooManyRequests(
                    "codes are sent at most once a minute, try again later".into(),
                ));
            }
        }

        // Claim the resend slot before delivery so concurrent sends see it.
        self.state
            .put(&rate_key(phone), &now_ms.to_string(), Some(RESEND_INTERVAL))
            .await?;

        let code = generate_code();
        let record = VerificationRecord {
            code: code.clone(),
            phone_number: phone.to_string(),
            created_at: now_ms,
            expires_at: now_ms + CODE_TTL.as_millis() as i64,
            failed_attempts: 0,
        };
        if let Err(e) = self
            .state
            .put_json(&code_key(phone), &record, Some(CODE_TTL))
            .await
        {
            self.state.delete(&rate_key(phone)).await?;
            return Err(e.into());
        }

        if let Err(e) = sender.send_code(phone, &code).await {
            warn!(phone, error = %e, "verification code delivery failed");
            self.state.delete(&code_key(phone)).await?;
            self.state.delete(&rate_key(phone)).await?;
            return Err(ApiError::Upstream(e.to_string()));
        }

        debug!(phone, "verification code issued");
        Ok(())
    }

    /// Consumes the stored code for `phone` when `code` matches it.
    ///
    /// Each mismatch is counted on the record; after [`MAX_CHECK_ATTEMPTS`]
    /// the code is discarded and a new one has to be requested.
    pub async fn check(&self, phone: &str, code: &str) -> ApiResult<()> {
        let key = code_key(phone);
        let mut record: VerificationRecord = self
            .state
            .get_json(&key)
            .await?
            .ok_or_else(|| ApiError::bad_request("verification code not found or expired"))?;

        let now_ms = Utc::now().timestamp_millis();
        if now_ms > record.expires_at {
            self.state.delete(&key).await?;
            return Err(ApiError::bad_request("verification code expired"));
        }

        if record.failed_attempts >= MAX_CHECK_ATTEMPTS {
            self.state.delete(&key).await?;
            return Err(too_many_attempts());
        }

        if record.code.as_bytes().ct_eq(code.trim().as_bytes()).unwrap_u8() != 1 {
            record.failed_attempts += 1;
            if record.failed_attempts >= MAX_CHECK_ATTEMPTS {
                warn!(phone, "verification code discarded after repeated mismatches");
                self.state.delete(&key).await?;
                return Err(too_many_attempts());
            }
            let remaining = Duration::from_millis((record.expires_at - now_ms).max(1) as u64);
            self.state.put_json(&key, &record, Some(remaining)).await?;
            return Err(ApiError::bad_request("verification code is incorrect"));
        }

        self.state.delete(&key).await?;
        self.mark_admin_verified(phone).await?;
        Ok(())
    }

    pub async fn mark_admin_verified(&self, phone: &str) -> Result<()> {
        self.state
            .put(&admin_verified_key(phone), "verified", Some(ADMIN_VERIFIED_TTL))
            .await
    }

    /// Returns whether `phone` passed SMS verification recently, clearing the marker.
    pub async fn take_admin_verified(&self, phone: &str) -> Result<bool> {
        let key = admin_verified_key(phone);
        if self.state.get(&key).await?.is_some() {
            self.state.delete(&key).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;
    use crate::store::MemoryStore;
    use tokio::sync::Mutex;

    const PHONE: &str = "13800138000";

    fn verifier() -> (SmsVerifier, Arc<RecordingSender>, Arc<dyn KvStore>) {
        let state: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::default());
        let v = SmsVerifier::new(state.clone(), Some(sender.clone()));
        (v, sender, state)
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn send_then_check_consumes_code() {
        let (v, sender, state) = verifier();
        v.send(PHONE).await.unwrap();

        let (phone, code) = sender.sent.lock().await[0].clone();
        assert_eq!(phone, PHONE);
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_some());

        v.check(PHONE, &code).await.unwrap();
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_none());

        // single use
        let again = v.check(PHONE, &code).await.unwrap_err();
        assert!(matches!(again, ApiError::BadRequest(_)));

        // success leaves an admin marker that can be taken once
        assert!(v.take_admin_verified(PHONE).await.unwrap());
        assert!(!v.take_admin_verified(PHONE).await.unwrap());
    }

    #[tokio::test]
    async fn resend_within_a_minute_is_limited() {
        let (v, _, _) = verifier();
        v.send(PHONE).await.unwrap();
        let err = v.send(PHONE).await.unwrap_err();
        assert!(matches!(err, ApiError::TooManyRequests(_)));
    }

    #[tokio::test]
    async fn wrong_code_is_rejected_and_kept() {
        let (v, sender, state) = verifier();
        v.send(PHONE).await.unwrap();
        let code = sender.sent.lock().await[0].1.clone();
        let wrong = if code == "999999" { "100000" } else { "999999" };

        let err = v.check(PHONE, wrong).await.unwrap_err();
        assert_eq!(err.to_string(), "verification code is incorrect");
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn code_is_discarded_after_repeated_mismatches() {
        let (v, sender, state) = verifier();
        v.send(PHONE).await.unwrap();
        let code = sender.sent.lock().await[0].1.clone();
        let wrong = if code == "999999" { "100000" } else { "999999" };

        for attempt in 1..MAX_CHECK_ATTEMPTS {
            let err = v.check(PHONE, wrong).await.unwrap_err();
            assert_eq!(err.to_string(), "verification code is incorrect");
            let record: VerificationRecord =
                state.get_json(&code_key(PHONE)).await.unwrap().unwrap();
            assert_eq!(record.failed_attempts, attempt);
        }

        let err = v.check(PHONE, wrong).await.unwrap_err();
        assert_eq!(err.to_string(), "too many incorrect attempts, request a new code");
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_none());

        // the real code no longer works either
        assert!(v.check(PHONE, &code).await.is_err());
        assert!(!v.take_admin_verified(PHONE).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_record_rejects_correct_code() {
        let (v, _, state) = verifier();
        let now = Utc::now().timestamp_millis();
        let record = VerificationRecord {
            code: "123456".into(),
            phone_number: PHONE.into(),
            created_at: now,
            expires_at: now + 300_000,
            failed_attempts: MAX_CHECK_ATTEMPTS,
        };
        state.put_json(&code_key(PHONE), &record, None).await.unwrap();

        let err = v.check(PHONE, "123456").await.unwrap_err();
        assert_eq!(err.to_string(), "too many incorrect attempts, request a new code");
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_without_attempt_count_still_checks() {
        let (v, _, state) = verifier();
        let now = Utc::now().timestamp_millis();
        let raw = format!(
            r#"{{"code":"654321","phoneNumber":"{PHONE}","createdAt":{now},"expiresAt":{}}}"#,
            now + 300_000
        );
        state.put(&code_key(PHONE), &raw, None).await.unwrap();
        v.check(PHONE, "654321").await.unwrap();
    }

    #[tokio::test]
    async fn expired_record_is_removed() {
        let (v, _, state) = verifier();
        let past = Utc::now().timestamp_millis() - 1_000;
        let record = VerificationRecord {
            code: "123456".into(),
            phone_number: PHONE.into(),
            created_at: past - 300_000,
            expires_at: past,
            failed_attempts: 0,
        };
        state.put_json(&code_key(PHONE), &record, None).await.unwrap();

        let err = v.check(PHONE, "123456").await.unwrap_err();
        assert_eq!(err.to_string(), "verification code expired");
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivery_failure_discards_code() {
        let state: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender {
            fail_with: Some("frequency limited".into()),
            ..Default::default()
        });
        let v = SmsVerifier::new(state.clone(), Some(sender));

        let err = v.send(PHONE).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream(ref m) if m == "frequency limited"));
        assert!(state.get(&code_key(PHONE)).await.unwrap().is_none());
        assert!(state.get(&rate_key(PHONE)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_delivery_allows_immediate_resend() {
        let state: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let failing = Arc::new(RecordingSender {
            fail_with: Some("gateway down".into()),
            ..Default::default()
        });
        SmsVerifier::new(state.clone(), Some(failing))
            .send(PHONE)
            .await
            .unwrap_err();

        let working = Arc::new(RecordingSender::default());
        SmsVerifier::new(state, Some(working.clone()))
            .send(PHONE)
            .await
            .unwrap();
        assert_eq!(working.sent.lock().await.len(), 1);
    }

    /// Sends a second code from inside delivery of the first.
    struct ReentrantSender {
        state: Arc<dyn KvStore>,
        nested: Mutex<Option<ApiError>>,
    }

    #[async_trait]
    impl SmsSender for ReentrantSender {
        async fn send_code(&self, phone: &str, _code: &str) -> Result<()> {
            let inner = SmsVerifier::new(
                self.state.clone(),
                Some(Arc::new(RecordingSender::default())),
            );
            if let Err(e) = inner.send(phone).await {
                *self.nested.lock().await = Some(e);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn resend_gate_is_held_during_delivery() {
        let state: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let sender = Arc::new(ReentrantSender {
            state: state.clone(),
            nested: Mutex::new(None),
        });
        SmsVerifier::new(state.clone(), Some(sender.clone()))
            .send(PHONE)
            .await
            .unwrap();

        let nested = sender.nested.lock().await.take();
        assert!(matches!(nested, Some(ApiError::TooManyRequests(_))));
        assert!(state.get(&rate_key(PHONE)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unconfigured_sender_is_unavailable() {
        let v = SmsVerifier::new(Arc::new(MemoryStore::new()), None);
        assert!(!v.is_configured());
        assert!(matches!(v.send(PHONE).await.unwrap_err(), ApiError::Unavailable(_)));
    }
}
