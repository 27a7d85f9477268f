//! SMS tool handler.
//!
//! Template-driven sending through a provider HTTP API with HMAC-SHA1
//! request signing (Aliyun-style signature over the sorted query string).

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    pub endpoint: String,
    pub key_id: String,
    pub key_secret: String,
    pub sign_name: String,
    /// `sha1` (base64, Aliyun-style) or `sha256` (hex, Tencent-style).
    #[serde(default)]
    pub signature: SignatureKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    #[default]
    Sha1,
    Sha256,
}

/// Canonicalise the query: sort by key, url-encode pairs, wrap in the
/// POST string-to-sign.
fn string_to_sign(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical = sorted
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(v)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("POST&%2F&{}", urlencoding::encode(&canonical))
}

/// HMAC-SHA1 over the canonical string, base64-encoded (Aliyun-style).
pub fn sign_query(params: &[(String, String)], secret: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(format!("{}&", secret).as_bytes())
        .expect("hmac accepts any key length");
    mac.update(string_to_sign(params).as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// HMAC-SHA256 over the canonical string, hex-encoded (Tencent-style).
pub fn sign_query_sha256(params: &[(String, String)], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(string_to_sign(params).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct SmsHandler {
    clients: HandleCache<Client>,
}

impl Default for SmsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SmsHandler {
    pub fn new() -> Self {
        Self {
            clients: HandleCache::default(),
        }
    }
}

#[async_trait]
impl ToolHandler for SmsHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        _path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: SmsConfig = serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid sms config: {}", e)))?;

        let phone = args
            .get("phone")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArgument("sms requires 'phone'".to_string()))?;
        let template_code = args
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArgument("sms requires 'template'".to_string()))?;
        let params = args
            .get("params")
            .map(|p| p.to_string())
            .unwrap_or_else(|| "{}".to_string());

        let mut query: Vec<(String, String)> = vec![
            ("AccessKeyId".to_string(), config.key_id.clone()),
            ("SignName".to_string(), config.sign_name.clone()),
            ("PhoneNumbers".to_string(), phone.to_string()),
            ("TemplateCode".to_string(), template_code.to_string()),
            ("TemplateParam".to_string(), params),
            (
                "Timestamp".to_string(),
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
            ("SignatureNonce".to_string(), uuid::Uuid::new_v4().to_string()),
        ];
        let signature = match config.signature {
            SignatureKind::Sha1 => sign_query(&query, &config.key_secret),
            SignatureKind::Sha256 => sign_query_sha256(&query, &config.key_secret),
        };
        query.push(("Signature".to_string(), signature));

        let key = HandleCache::<Client>::key(&ctx.tenant_id, service);
        let client = self
            .clients
            .get_or_create(&key, || async {
                Client::builder()
                    .build()
                    .map_err(|e| ToolError::Connection(e.to_string()))
            })
            .await?;

        let response = client
            .post(&config.endpoint)
            .timeout(ctx.remaining())
            .form(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(ctx.remaining().as_millis() as u64)
                } else {
                    ToolError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ToolError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(serde_json::from_str(&body).unwrap_or(serde_json::json!({
            "sent": true,
            "phone": phone,
        })))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "sms".to_string(),
            description: "Template SMS sending with signed requests".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.clients.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_query_is_deterministic_and_order_independent() {
        let a = vec![
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ];
        let b = vec![
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ];
        assert_eq!(sign_query(&a, "secret"), sign_query(&b, "secret"));
        assert_ne!(sign_query(&a, "secret"), sign_query(&a, "other"));
    }

    #[test]
    fn test_sha256_signature_is_hex() {
        let params = vec![("A".to_string(), "1".to_string())];
        let signature = sign_query_sha256(&params, "secret");
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature.len(), 64);
    }
}
