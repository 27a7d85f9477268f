//! Internal service invocation handler.
//!
//! `svc://<service>/<method>` posts the args as JSON to a configured
//! service endpoint. Thin wrapper over HTTP with tenant propagation.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct SvcConfig {
    pub base_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

pub struct SvcHandler {
    clients: HandleCache<Client>,
}

impl Default for SvcHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SvcHandler {
    pub fn new() -> Self {
        Self {
            clients: HandleCache::default(),
        }
    }
}

#[async_trait]
impl ToolHandler for SvcHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: SvcConfig = serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid svc config: {}", e)))?;

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

        let mut request = client
            .post(&url)
            .timeout(ctx.remaining())
            .header("Content-Type", "application/json")
            .header("X-Tenant-Id", &ctx.tenant_id);
        for (k, v) in &config.headers {
            request = request.header(k, v);
        }

        let response = request.json(&args).send().await.map_err(|e| {
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

        response
            .json()
            .await
            .map_err(|e| ToolError::Execution(format!("invalid service response: {}", e)))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "svc".to_string(),
            description: "JSON-over-HTTP internal service calls".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.clients.drain();
    }
}
