use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::sms::signer::SignatureVersion;

pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const DEFAULT_CF_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_SMS_ENDPOINT: &str = "https://dypnsapi.aliyuncs.com/";

fn default_port() -> u16 {
    8080
}

fn default_admin_password() -> String {
    DEFAULT_ADMIN_PASSWORD.to_string()
}

fn default_rate_limit() -> usize {
    30
}

fn default_api_base() -> String {
    DEFAULT_CF_API_BASE.to_string()
}

fn default_sms_endpoint() -> String {
    DEFAULT_SMS_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceIds {
    pub advices: String,
    pub bulletins: String,
    pub sessions: String,
    pub admin_config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudflareConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub account_id: String,
    pub api_token: String,
    pub namespaces: NamespaceIds,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Cloudflare(CloudflareConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub sign_name: String,
    pub template_code: String,
    #[serde(default = "default_sms_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub signature_version: SignatureVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
    /// Password for bulletin logins; the admin password is used when unset.
    #[serde(default)]
    pub bulletin_password: Option<String>,
    /// Fallback phone list used until one is saved in the admin namespace.
    #[serde(default)]
    pub authorized_phones: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: usize,
    #[serde(default)]
    pub store: StoreBackend,
    #[serde(default)]
    pub sms: Option<SmsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_password: default_admin_password(),
            bulletin_password: None,
            authorized_phones: Vec::new(),
            rate_limit_per_min: default_rate_limit(),
            store: StoreBackend::Memory,
            sms: None,
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn parse_phone_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON config")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Read `path` when it exists, then let environment variables override it.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = if Path::new(path).is_file() {
            info!("loading config from {}", path);
            let mut cfg = Self::from_file(path)?;
            cfg.apply_env()?;
            cfg
        } else {
            info!("config file {} not found, using environment only", path);
            Self::from_env()?
        };
        cfg.warn_insecure_defaults();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env("PORT") {
            self.port = port.parse().context("invalid PORT")?;
        }
        if let Some(pass) = env("ADMIN_PASSWORD") {
            self.admin_password = pass;
        }
        if let Some(pass) = env("BULLETIN_PASS") {
            self.bulletin_password = Some(pass);
        }
        if let Some(phones) = env("ADMIN_AUTHORIZED_PHONES") {
            self.authorized_phones = parse_phone_list(&phones);
        }
        if let Some(limit) = env("RATE_LIMIT_PER_MIN") {
            self.rate_limit_per_min = limit.parse().context("invalid RATE_LIMIT_PER_MIN")?;
        }

        match env("KV_BACKEND").as_deref() {
            None => {}
            Some("memory") => self.store = StoreBackend::Memory,
            Some("cloudflare") => {
                let required = |key: &str| env(key).with_context(|| format!("{key} is required for the cloudflare backend"));
                self.store = StoreBackend::Cloudflare(CloudflareConfig {
                    api_base: env("CF_API_BASE").unwrap_or_else(default_api_base),
                    account_id: required("CF_ACCOUNT_ID")?,
                    api_token: required("CF_API_TOKEN")?,
                    namespaces: NamespaceIds {
                        advices: required("CF_KV_ADVICES")?,
                        bulletins: required("CF_KV_BULLETINS")?,
                        sessions: required("CF_KV_SESSIONS")?,
                        admin_config: required("CF_KV_ADMIN_CONFIG")?,
                    },
                });
            }
            Some(other) => bail!("unknown KV_BACKEND: {other}"),
        }

        let sms_keys = (
            env("ALIYUN_ACCESS_KEY_ID"),
            env("ALIYUN_ACCESS_KEY_SECRET"),
            env("ALIYUN_SMS_SIGN_NAME"),
            env("ALIYUN_SMS_TEMPLATE_CODE"),
        );
        if let (Some(id), Some(secret), Some(sign), Some(template)) = sms_keys {
            let previous = self.sms.take();
            self.sms = Some(SmsConfig {
                access_key_id: id,
                access_key_secret: secret,
                sign_name: sign,
                template_code: template,
                endpoint: previous
                    .as_ref()
                    .map(|s| s.endpoint.clone())
                    .unwrap_or_else(default_sms_endpoint),
                signature_version: previous.map(|s| s.signature_version).unwrap_or_default(),
            });
        }
        if let Some(sms) = self.sms.as_mut() {
            if let Some(endpoint) = env("ALIYUN_SMS_ENDPOINT") {
                sms.endpoint = endpoint;
            }
            if let Some(version) = env("ALIYUN_SIGNATURE_VERSION") {
                sms.signature_version = version.parse()?;
            }
        }
        Ok(())
    }

    pub fn bulletin_password(&self) -> &str {
        self.bulletin_password.as_deref().unwrap_or(&self.admin_password)
    }

    fn warn_insecure_defaults(&self) {
        if self.admin_password == DEFAULT_ADMIN_PASSWORD {
            warn!("ADMIN_PASSWORD not set, using the built-in default");
        }
        if self.sms.is_none() {
            warn!("Aliyun SMS not configured; phone logins are unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "port": 9000,
                "admin_password": "s3cret",
                "authorized_phones": ["13800138000"],
                "store": {{
                    "backend": "cloudflare",
                    "account_id": "acc",
                    "api_token": "tok",
                    "namespaces": {{
                        "advices": "a", "bulletins": "b",
                        "sessions": "s", "admin_config": "c"
                    }}
                }},
                "sms": {{
                    "access_key_id": "ak",
                    "access_key_secret": "sk",
                    "sign_name": "Board",
                    "template_code": "SMS_1",
                    "signature_version": "v3"
                }}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.admin_password, "s3cret");
        assert_eq!(config.bulletin_password(), "s3cret");
        assert_eq!(config.rate_limit_per_min, 30);
        assert_eq!(config.authorized_phones, vec!["13800138000"]);

        match config.store {
            StoreBackend::Cloudflare(cf) => {
                assert_eq!(cf.api_base, DEFAULT_CF_API_BASE);
                assert_eq!(cf.namespaces.sessions, "s");
            }
            other => panic!("unexpected backend: {:?}", other),
        }

        let sms = config.sms.unwrap();
        assert_eq!(sms.endpoint, DEFAULT_SMS_ENDPOINT);
        assert_eq!(sms.signature_version, SignatureVersion::V3);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.admin_password, DEFAULT_ADMIN_PASSWORD);
        assert!(matches!(config.store, StoreBackend::Memory));
        assert!(config.sms.is_none());
    }

    #[test]
    fn test_config_missing_file() {
        let result = Config::from_file("/nonexistent/path/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_without_file_reads_environment() {
        let loaded = Config::load("/nonexistent/path/config.json").unwrap();
        let from_env = Config::from_env().unwrap();
        assert_eq!(loaded.port, from_env.port);
        assert_eq!(loaded.admin_password, from_env.admin_password);
        assert_eq!(loaded.authorized_phones, from_env.authorized_phones);
        assert_eq!(loaded.rate_limit_per_min, from_env.rate_limit_per_min);
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        let result = Config::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_phone_list_parsing() {
        assert_eq!(
            parse_phone_list(" 13800138000, ,13900139000,"),
            vec!["13800138000", "13900139000"]
        );
        assert!(parse_phone_list("").is_empty());
    }

    #[test]
    fn test_bulletin_password_override() {
        let config = Config {
            bulletin_password: Some("notice".into()),
            ..Config::default()
        };
        assert_eq!(config.bulletin_password(), "notice");
    }
}
