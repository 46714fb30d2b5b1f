use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::KvStore;

const LIST_PAGE_LIMIT: &str = "1000";

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Vec<KeyEntry>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("creating HTTP client")
}

/// One Workers KV namespace reached through the Cloudflare REST API.
#[derive(Debug, Clone)]
pub struct CloudflareKv {
    namespace_url: String,
    api_token: String,
    http_client: Client,
}

impl CloudflareKv {
    pub fn new(api_base: &str, account_id: &str, namespace_id: &str, api_token: &str) -> Result<Self> {
        Ok(Self::with_client(http_client()?, api_base, account_id, namespace_id, api_token))
    }

    pub fn with_client(
        http_client: Client,
        api_base: &str,
        account_id: &str,
        namespace_id: &str,
        api_token: &str,
    ) -> Self {
        let namespace_url = format!(
            "{}/accounts/{}/storage/kv/namespaces/{}",
            api_base.trim_end_matches('/'),
            account_id,
            namespace_id
        );
        debug!("Cloudflare KV namespace at {}", namespace_url);
        Self {
            namespace_url,
            api_token: api_token.to_string(),
            http_client,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.namespace_url).context("parsing KV namespace URL")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("KV namespace URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fail(response: reqwest::Response, op: &str) -> anyhow::Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow!("KV {} failed with status {}: {}", op, status, body)
    }
}

#[async_trait]
impl KvStore for CloudflareKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = self.url(&["values", key])?;
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("sending KV get request")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::fail(response, "get").await);
        }
        let body = response.text().await.context("reading KV value")?;
        Ok(Some(body))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut url = self.url(&["values", key])?;
        if let Some(ttl) = ttl {
            url.query_pairs_mut()
                .append_pair("expiration_ttl", &ttl.as_secs().to_string());
        }
        let response = self
            .http_client
            .put(url)
            .bearer_auth(&self.api_token)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(value.to_string())
            .send()
            .await
            .context("sending KV put request")?;

        if !response.status().is_success() {
            return Err(Self::fail(response, "put").await);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.url(&["values", key])?;
        let response = self
            .http_client
            .delete(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("sending KV delete request")?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(key, "KV delete of a missing key");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::fail(response, "delete").await);
        }
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.url(&["keys"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", LIST_PAGE_LIMIT);
                if let Some(p) = prefix {
                    query.append_pair("prefix", p);
                }
                if let Some(c) = cursor.as_deref() {
                    query.append_pair("cursor", c);
                }
            }

            let response = self
                .http_client
                .get(url)
                .bearer_auth(&self.api_token)
                .send()
                .await
                .context("sending KV list request")?;
            if !response.status().is_success() {
                return Err(Self::fail(response, "list").await);
            }

            let page: ListKeysResponse = response.json().await.context("parsing KV key list")?;
            if !page.success {
                return Err(anyhow!("KV list rejected: {:?}", page.errors));
            }
            keys.extend(page.result.into_iter().map(|k| k.name));

            cursor = page
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "cloudflare"
    }
}
