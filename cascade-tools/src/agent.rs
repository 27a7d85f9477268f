//! Agent runtime seam.
//!
//! Agent and handoff nodes delegate to an external model runtime behind
//! the [`AgentRuntime`] trait; the engine addresses it through the registry
//! as `agent://<model-or-target>`. A mock runtime ships for tests.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::InvokeContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// External model runtime. Implementations live outside the core.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn complete(&self, request: AgentRequest, ctx: &InvokeContext)
        -> ToolResult<AgentResponse>;
}

/// Deterministic runtime for tests: echoes the last message.
#[derive(Default)]
pub struct MockAgentRuntime;

#[async_trait]
impl AgentRuntime for MockAgentRuntime {
    async fn complete(
        &self,
        request: AgentRequest,
        _ctx: &InvokeContext,
    ) -> ToolResult<AgentResponse> {
        let last = request
            .messages
            .last()
            .map(|m| m.to_string())
            .unwrap_or_default();
        Ok(AgentResponse {
            content: format!("[{}] {}", request.model, last),
            finish_reason: Some("stop".to_string()),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

/// Adapts an [`AgentRuntime`] to the registry's handler interface.
/// The URI service segment is the model (or handoff target).
pub struct AgentHandler {
    runtime: Arc<dyn AgentRuntime>,
}

impl AgentHandler {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ToolHandler for AgentHandler {
    async fn invoke(
        &self,
        service: &str,
        _config: &Value,
        _path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let mut request: AgentRequest = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArgument(format!("invalid agent request: {}", e)))?;
        if request.model.is_empty() {
            request.model = service.to_string();
        }

        let response = self.runtime.complete(request, ctx).await?;
        serde_json::to_value(&response).map_err(|e| ToolError::Execution(e.to_string()))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "agent".to_string(),
            description: "Model runtime delegation".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_runtime_echoes() {
        let runtime = MockAgentRuntime;
        let ctx = InvokeContext::new("t1", Duration::from_secs(1));
        let response = runtime
            .complete(
                AgentRequest {
                    model: "m1".to_string(),
                    system: None,
                    messages: vec![serde_json::json!("hello")],
                    tools: vec![],
                    temperature: None,
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(response.content.contains("m1"));
        assert!(response.content.contains("hello"));
    }
}
