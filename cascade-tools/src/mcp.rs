//! MCP (Model Context Protocol) client seam.
//!
//! `mcp://<server>/<tool>` invokes a tool on a configured MCP server. The
//! default client speaks JSON-RPC over HTTP (`tools/call`); stdio or other
//! transports can be plugged in through the [`McpClient`] trait.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn call_tool(
        &self,
        config: &McpServerConfig,
        tool: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value>;
}

/// JSON-RPC-over-HTTP MCP client.
pub struct HttpMcpClient {
    clients: HandleCache<Client>,
}

impl Default for HttpMcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpMcpClient {
    pub fn new() -> Self {
        Self {
            clients: HandleCache::default(),
        }
    }
}

#[async_trait]
impl McpClient for HttpMcpClient {
    async fn call_tool(
        &self,
        config: &McpServerConfig,
        tool: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let client = self
            .clients
            .get_or_create(&config.url, || async {
                Client::builder()
                    .build()
                    .map_err(|e| ToolError::Connection(e.to_string()))
            })
            .await?;

        let request_body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": "tools/call",
            "params": { "name": tool, "arguments": args },
        });

        let mut request = client
            .post(&config.url)
            .timeout(ctx.remaining())
            .json(&request_body);
        if let Some(token) = &config.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
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

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Execution(format!("invalid MCP response: {}", e)))?;

        if let Some(error) = body.get("error") {
            return Err(ToolError::Execution(format!("MCP error: {}", error)));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Registry adapter: resolves the server config and delegates to a client.
pub struct McpHandler {
    client: Arc<dyn McpClient>,
}

impl McpHandler {
    pub fn new(client: Arc<dyn McpClient>) -> Self {
        Self { client }
    }
}

impl Default for McpHandler {
    fn default() -> Self {
        Self::new(Arc::new(HttpMcpClient::new()))
    }
}

#[async_trait]
impl ToolHandler for McpHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: McpServerConfig = serde_json::from_value(config.clone()).map_err(|_| {
            ToolError::ServiceNotFound {
                scheme: "mcp".to_string(),
                service: service.to_string(),
            }
        })?;
        if path.is_empty() {
            return Err(ToolError::InvalidArgument(
                "mcp URI must name a tool".to_string(),
            ));
        }
        self.client.call_tool(&config, path, args, ctx).await
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "mcp".to_string(),
            description: "Model Context Protocol tool calls".to_string(),
        }
    }
}
