//! Aliyun OpenAPI request signing.
//!
//! Two schemes are supported:
//!
//! * **V1 (RPC)**: parameters are sorted and percent-encoded into a canonical
//!   query, wrapped as `METHOD&%2F&enc(query)` and signed with
//!   HMAC-SHA1 keyed by `secret + "&"`. The base64 signature travels as the
//!   `Signature` parameter.
//! * **V3 (ACS3-HMAC-SHA256)**: a canonical request over method, path, query,
//!   signed headers and the SHA-256 of the body is hashed, prefixed with the
//!   algorithm name and signed with HMAC-SHA256. The hex signature travels in
//!   the `Authorization` header.
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ring::hmac as ring_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

pub const V3_ALGORITHM: &str = "ACS3-HMAC-SHA256";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureVersion {
    #[default]
    V1,
    V3,
}

impl FromStr for SignatureVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" | "1.0" | "rpc" => Ok(SignatureVersion::V1),
            "v3" | "3" | "acs3" => Ok(SignatureVersion::V3),
            other => Err(anyhow!("unknown signature version: {other}")),
        }
    }
}

/// RFC 3986 encoding: only unreserved characters survive unescaped.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// `YYYY-MM-DDThh:mm:ssZ`, the only timestamp shape the gateway accepts.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Sorted `enc(k)=enc(v)` pairs joined with `&`.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn hex_sha256(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

// ---------------------------------------------------------------------------
// V1 / RPC
// ---------------------------------------------------------------------------

pub fn rpc_string_to_sign(method: &str, params: &BTreeMap<String, String>) -> String {
    let filtered: BTreeMap<String, String> = params
        .iter()
        .filter(|(k, _)| k.as_str() != "Signature")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode("/"),
        percent_encode(&canonical_query(&filtered))
    )
}

pub fn rpc_signature(access_key_secret: &str, string_to_sign: &str) -> String {
    let key_bytes = format!("{access_key_secret}&");
    let key = ring_hmac::Key::new(ring_hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key_bytes.as_bytes());
    let tag = ring_hmac::sign(&key, string_to_sign.as_bytes());
    general_purpose::STANDARD.encode(tag.as_ref())
}

/// Adds the common V1 parameters and the signature to `params`.
pub fn sign_rpc(
    method: &str,
    access_key_id: &str,
    access_key_secret: &str,
    mut params: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    nonce: &str,
) -> BTreeMap<String, String> {
    params.insert("AccessKeyId".into(), access_key_id.into());
    params.insert("Format".into(), "JSON".into());
    params.insert("SignatureMethod".into(), "HMAC-SHA1".into());
    params.insert("SignatureVersion".into(), "1.0".into());
    params.insert("SignatureNonce".into(), nonce.into());
    params.insert("Timestamp".into(), format_timestamp(timestamp));

    let string_to_sign = rpc_string_to_sign(method, &params);
    let signature = rpc_signature(access_key_secret, &string_to_sign);
    params.insert("Signature".into(), signature);
    params
}

/// `application/x-www-form-urlencoded` body with every value encoded once.
pub fn form_body(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---------------------------------------------------------------------------
// V3 / ACS3-HMAC-SHA256
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct V3Request<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub action: &'a str,
    pub version: &'a str,
    pub query: &'a BTreeMap<String, String>,
    pub body: &'a [u8],
    pub content_type: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V3Signed {
    /// Headers to send, lowercase names, including `authorization`.
    pub headers: BTreeMap<String, String>,
    pub canonical_request: String,
    pub string_to_sign: String,
    pub signature: String,
}

pub fn v3_signed_headers(request: &V3Request<'_>, timestamp: DateTime<Utc>, nonce: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("host".to_string(), request.host.to_string());
    headers.insert("x-acs-action".to_string(), request.action.to_string());
    headers.insert("x-acs-version".to_string(), request.version.to_string());
    headers.insert("x-acs-date".to_string(), format_timestamp(timestamp));
    headers.insert("x-acs-signature-nonce".to_string(), nonce.to_string());
    headers.insert("x-acs-content-sha256".to_string(), hex_sha256(request.body));
    if let Some(ct) = request.content_type {
        headers.insert("content-type".to_string(), ct.to_string());
    }
    headers
}

pub fn v3_canonical_request(request: &V3Request<'_>, headers: &BTreeMap<String, String>) -> (String, String) {
    // BTreeMap keeps names sorted; only host, content-type and x-acs-* are signed
    let signed: Vec<(&String, &String)> = headers
        .iter()
        .filter(|(k, _)| k.as_str() == "host" || k.as_str() == "content-type" || k.starts_with("x-acs-"))
        .collect();

    let canonical_headers: String = signed
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let path = if request.path.is_empty() { "/" } else { request.path };
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method.to_ascii_uppercase(),
        path,
        canonical_query(request.query),
        canonical_headers,
        signed_headers,
        hex_sha256(request.body)
    );
    (canonical, signed_headers)
}

pub fn v3_signature(access_key_secret: &str, string_to_sign: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(access_key_secret.as_bytes())
        .map_err(|_| anyhow!("invalid hmac key"))?;
    mac.update(string_to_sign.as_bytes());
    Ok(format!("{:x}", mac.finalize().into_bytes()))
}

pub fn sign_v3(
    request: &V3Request<'_>,
    access_key_id: &str,
    access_key_secret: &str,
    timestamp: DateTime<Utc>,
    nonce: &str,
) -> Result<V3Signed> {
    let mut headers = v3_signed_headers(request, timestamp, nonce);
    let (canonical_request, signed_headers) = v3_canonical_request(request, &headers);
    let string_to_sign = format!("{}\n{}", V3_ALGORITHM, hex_sha256(canonical_request.as_bytes()));
    let signature = v3_signature(access_key_secret, &string_to_sign)?;

    headers.insert(
        "authorization".to_string(),
        format!(
            "{} Credential={},SignedHeaders={},Signature={}",
            V3_ALGORITHM, access_key_id, signed_headers, signature
        ),
    );

    Ok(V3Signed {
        headers,
        canonical_request,
        string_to_sign,
        signature,
    })
}
