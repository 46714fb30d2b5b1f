use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::signer::{self, SignatureVersion, V3Request};
use super::SmsSender;
use crate::config::SmsConfig;

pub const SEND_VERIFY_CODE_ACTION: &str = "SendSmsVerifyCode";
pub const DYPNS_API_VERSION: &str = "2017-05-25";

#[derive(Debug, Deserialize)]
struct AliyunResponse {
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "RequestId")]
    request_id: Option<String>,
}

/// Sends verification codes through the Aliyun phone-number verification API.
#[derive(Debug, Clone)]
pub struct AliyunSmsClient {
    config: SmsConfig,
    endpoint: Url,
    http_client: Client,
}

impl AliyunSmsClient {
    pub fn new(config: SmsConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).context("parsing SMS endpoint")?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("creating HTTP client")?;
        debug!(endpoint = %endpoint, version = ?config.signature_version, "Aliyun SMS client initialized");
        Ok(Self {
            config,
            endpoint,
            http_client,
        })
    }

    fn business_params(&self, phone: &str, code: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("PhoneNumber".to_string(), phone.to_string());
        params.insert("SignName".to_string(), self.config.sign_name.clone());
        params.insert("TemplateCode".to_string(), self.config.template_code.clone());
        params.insert("TemplateParam".to_string(), json!({ "code": code }).to_string());
        params
    }

    async fn send_v1(&self, params: BTreeMap<String, String>) -> Result<reqwest::Response> {
        let mut params = params;
        params.insert("Action".to_string(), SEND_VERIFY_CODE_ACTION.to_string());
        params.insert("Version".to_string(), DYPNS_API_VERSION.to_string());
        let signed = signer::sign_rpc(
            "POST",
            &self.config.access_key_id,
            &self.config.access_key_secret,
            params,
            Utc::now(),
            &Uuid::new_v4().to_string(),
        );

        self.http_client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(signer::form_body(&signed))
            .send()
            .await
            .context("sending SMS request")
    }

    async fn send_v3(&self, params: BTreeMap<String, String>) -> Result<reqwest::Response> {
        let host = match (self.endpoint.host_str(), self.endpoint.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            _ => return Err(anyhow!("SMS endpoint has no host")),
        };
        let path = self.endpoint.path().to_string();
        let request = V3Request {
            method: "POST",
            host: &host,
            path: &path,
            action: SEND_VERIFY_CODE_ACTION,
            version: DYPNS_API_VERSION,
            query: &params,
            body: b"",
            content_type: None,
        };
        let signed = signer::sign_v3(
            &request,
            &self.config.access_key_id,
            &self.config.access_key_secret,
            Utc::now(),
            &Uuid::new_v4().to_string(),
        )?;

        let mut headers = HeaderMap::new();
        for (name, value) in signed.headers.iter().filter(|(k, _)| k.as_str() != "host") {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        let mut url = self.endpoint.clone();
        url.set_query(Some(&signer::canonical_query(&params)));

        self.http_client
            .post(url)
            .headers(headers)
            .send()
            .await
            .context("sending SMS request")
    }
}

#[async_trait]
impl SmsSender for AliyunSmsClient {
    async fn send_code(&self, phone: &str, code: &str) -> Result<()> {
        let params = self.business_params(phone, code);
        let response = match self.config.signature_version {
            SignatureVersion::V1 => self.send_v1(params).await?,
            SignatureVersion::V3 => self.send_v3(params).await?,
        };

        let status = response.status();
        let body = response.text().await.context("reading SMS response")?;
        let parsed: AliyunResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("SMS gateway returned status {}: {}", status, body))?;

        if parsed.code.as_deref() == Some("OK") {
            info!(request_id = parsed.request_id.as_deref().unwrap_or(""), "verification code sent");
            Ok(())
        } else {
            warn!(
                status = %status,
                code = parsed.code.as_deref().unwrap_or(""),
                request_id = parsed.request_id.as_deref().unwrap_or(""),
                "SMS gateway rejected request"
            );
            Err(anyhow!(parsed
                .message
                .unwrap_or_else(|| "failed to send verification code".to_string())))
        }
    }
}
