use anyhow::Result;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::config::parse_phone_list;
use crate::error::{ApiError, ApiResult};
use crate::store::KvStore;

pub const AUTHORIZED_PHONES_KEY: &str = "AUTHORIZED_PHONES";

fn phone_re() -> &'static Regex {
    static PHONE_RE: OnceLock<Regex> = OnceLock::new();
    PHONE_RE.get_or_init(|| Regex::new(r"^1[3-9]\d{9}$").expect("valid phone regex"))
}

/// Mainland mobile numbers: 11 digits starting with 13-19.
pub fn is_valid_phone(phone: &str) -> bool {
    phone_re().is_match(phone)
}

pub fn require_valid_phone(phone: &str) -> ApiResult<()> {
    if is_valid_phone(phone) {
        Ok(())
    } else {
        Err(ApiError::bad_request("invalid phone number format"))
    }
}

/// The list of phones allowed to log in as administrators.
#[derive(Clone)]
pub struct AuthorizedPhones {
    admin_config: Arc<dyn KvStore>,
    fallback: Vec<String>,
}

impl AuthorizedPhones {
    pub fn new(admin_config: Arc<dyn KvStore>, fallback: Vec<String>) -> Self {
        Self {
            admin_config,
            fallback,
        }
    }

    /// The saved list, or the configured fallback when nothing is saved yet.
    /// A saved empty list stays empty.
    pub async fn list(&self) -> Result<Vec<String>> {
        let stored = self.admin_config.get(AUTHORIZED_PHONES_KEY).await?;
        let raw = match stored {
            Some(s) => parse_phone_list(&s),
            None => {
                debug!("no saved phone list, using configured fallback");
                self.fallback.clone()
            }
        };
        Ok(raw.into_iter().filter(|p| is_valid_phone(p)).collect())
    }

    pub async fn contains(&self, phone: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|p| p == phone))
    }

    pub async fn add(&self, phone: &str) -> ApiResult<Vec<String>> {
        require_valid_phone(phone)?;
        let mut phones = self.list().await?;
        if phones.iter().any(|p| p == phone) {
            return Err(ApiError::Conflict("phone number already authorized".into()));
        }
        phones.push(phone.to_string());
        self.save(&phones).await?;
        Ok(phones)
    }

    pub async fn remove(&self, phone: &str) -> ApiResult<Vec<String>> {
        require_valid_phone(phone)?;
        let mut phones = self.list().await?;
        let before = phones.len();
        phones.retain(|p| p != phone);
        if phones.len() == before {
            return Err(ApiError::not_found("phone number is not authorized"));
        }
        self.save(&phones).await?;
        Ok(phones)
    }

    async fn save(&self, phones: &[String]) -> Result<()> {
        self.admin_config
            .put(AUTHORIZED_PHONES_KEY, &phones.join(","), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn phones(fallback: &[&str]) -> (AuthorizedPhones, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let list = AuthorizedPhones::new(kv.clone(), fallback.iter().map(|s| s.to_string()).collect());
        (list, kv)
    }

    #[test]
    fn phone_format() {
        assert!(is_valid_phone("13800138000"));
        assert!(is_valid_phone("19912345678"));
        assert!(!is_valid_phone("12800138000"));
        assert!(!is_valid_phone("1380013800"));
        assert!(!is_valid_phone("138001380001"));
        assert!(!is_valid_phone("1380013800a"));
        assert!(!is_valid_phone(""));
    }

    #[tokio::test]
    async fn falls_back_until_saved() {
        let (list, kv) = phones(&["13800138000", "bogus"]);
        assert_eq!(list.list().await.unwrap(), vec!["13800138000"]);

        kv.put(AUTHORIZED_PHONES_KEY, "13900139000, 15000150000", None)
            .await
            .unwrap();
        assert_eq!(list.list().await.unwrap(), vec!["13900139000", "15000150000"]);
        assert!(!list.contains("13800138000").await.unwrap());
    }

    #[tokio::test]
    async fn add_seeds_from_fallback_and_persists() {
        let (list, kv) = phones(&["13800138000"]);
        let updated = list.add("13900139000").await.unwrap();
        assert_eq!(updated, vec!["13800138000", "13900139000"]);
        assert_eq!(
            kv.get(AUTHORIZED_PHONES_KEY).await.unwrap().as_deref(),
            Some("13800138000,13900139000")
        );

        let dup = list.add("13900139000").await.unwrap_err();
        assert!(matches!(dup, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn remove_requires_presence() {
        let (list, _) = phones(&["13800138000", "13900139000"]);
        let updated = list.remove("13800138000").await.unwrap();
        assert_eq!(updated, vec!["13900139000"]);

        let missing = list.remove("13800138000").await.unwrap_err();
        assert!(matches!(missing, ApiError::NotFound(_)));

        let invalid = list.remove("123").await.unwrap_err();
        assert!(matches!(invalid, ApiError::BadRequest(_)));

        list.remove("13900139000").await.unwrap();
        assert!(list.list().await.unwrap().is_empty());
    }
}
