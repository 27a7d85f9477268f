//! HTTP API tool handler.
//!
//! Sends JSON requests to configured services. Auth modes: none, Bearer,
//! Basic, API key header, or arbitrary custom headers. Service default
//! headers are merged under the per-request metadata.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Headers sent on every request to this service.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        key: String,
    },
    Custom {
        headers: HashMap<String, String>,
    },
}

pub struct ApiHandler {
    clients: HandleCache<Client>,
}

impl Default for ApiHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiHandler {
    pub fn new() -> Self {
        Self {
            clients: HandleCache::default(),
        }
    }

    fn parse_config(config: &Value) -> ToolResult<ApiConfig> {
        serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid api config: {}", e)))
    }
}

/// Build the auth headers for a request.
fn auth_headers(auth: &AuthConfig) -> ToolResult<Vec<(String, String)>> {
    let headers = match auth {
        AuthConfig::None => Vec::new(),
        AuthConfig::Bearer { token } => {
            vec![("Authorization".to_string(), format!("Bearer {}", token))]
        }
        AuthConfig::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            vec![("Authorization".to_string(), format!("Basic {}", encoded))]
        }
        AuthConfig::ApiKey { header, key } => vec![(header.clone(), key.clone())],
        AuthConfig::Custom { headers } => headers.clone().into_iter().collect(),
    };
    Ok(headers)
}

#[async_trait]
impl ToolHandler for ApiHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config = Self::parse_config(config)?;
        if config.base_url.is_empty() {
            return Err(ToolError::ServiceNotFound {
                scheme: "api".to_string(),
                service: service.to_string(),
            });
        }

        let key = HandleCache::<Client>::key(&ctx.tenant_id, service);
        let client = self
            .clients
            .get_or_create(&key, || async {
                Client::builder()
                    .build()
                    .map_err(|e| ToolError::Connection(e.to_string()))
            })
            .await?;

        let url = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        // `_method` in args selects the HTTP verb; the rest is the body.
        let (method, body) = match &args {
            Value::Object(map) => {
                let method = map
                    .get("_method")
                    .and_then(Value::as_str)
                    .unwrap_or("POST")
                    .to_uppercase();
                let mut body = map.clone();
                body.remove("_method");
                (method, Value::Object(body))
            }
            other => ("POST".to_string(), other.clone()),
        };

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolError::InvalidArgument(format!("invalid HTTP method {}", method)))?;

        let mut request = client
            .request(method.clone(), &url)
            .timeout(ctx.remaining())
            .header("Content-Type", "application/json")
            .header("X-Tenant-Id", &ctx.tenant_id);

        for (k, v) in &config.headers {
            request = request.header(k, v);
        }
        for (k, v) in auth_headers(&config.auth)? {
            request = request.header(&k, &v);
        }
        for (k, v) in &ctx.metadata {
            request = request.header(k, v);
        }

        if method != reqwest::Method::GET {
            request = request.json(&body);
        } else if let Value::Object(params) = &body {
            let query: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| {
                    let val = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), val)
                })
                .collect();
            request = request.query(&query);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(ctx.remaining().as_millis() as u64)
            } else {
                ToolError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ToolError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Connection(e.to_string()))?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        // Non-JSON bodies come back as plain strings.
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "api".to_string(),
            description: "HTTP API calls with configurable auth".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.clients.drain();
    }
}
