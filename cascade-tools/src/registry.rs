//! Tool registry: scheme handlers, per-service configuration and the
//! deadline-enforcing invocation path.

use crate::error::{ToolError, ToolResult};
use crate::{InvokeContext, ToolOutput, ToolUri};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A tool handler serves one URI scheme (`api`, `db`, `mq`, ...).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool addressed by `path` for `(tenant, service)`.
    /// `config` is the service's registered configuration (empty object if
    /// none). Implementations must respect `ctx.deadline` and `ctx.cancel`.
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value>;

    fn metadata(&self) -> ToolMetadata;

    /// Drop any pooled connections. Called once on registry shutdown.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

/// Per-tool invocation policy, resolvable from the service configuration
/// and overridable through URI options.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub code: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for ToolSpec {
    fn default() -> Self {
        Self {
            code: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            backoff_ms: 200,
        }
    }
}

/// Registered configuration for one `(tenant, scheme, service)` tuple.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Scheme-specific connection settings (base URL, credentials, ...).
    pub config: Value,
    pub default_timeout_ms: Option<u64>,
    /// Per-tool overrides keyed by tool path.
    pub tools: HashMap<String, ToolSpec>,
}

impl ServiceConfig {
    pub fn new(config: Value) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Resolve the effective spec for a tool path, then apply URI options.
    pub fn tool_spec(&self, uri: &ToolUri) -> ToolSpec {
        let mut spec = self
            .tools
            .get(&uri.path)
            .cloned()
            .unwrap_or_else(|| ToolSpec {
                code: uri.path.clone(),
                timeout_ms: self.default_timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                ..ToolSpec::default()
            });
        if let Some(timeout) = uri.option_u64("timeout_ms") {
            spec.timeout_ms = timeout;
        }
        if let Some(retries) = uri.option_u64("max_retries") {
            spec.max_retries = retries as u32;
        }
        if let Some(backoff) = uri.option_u64("backoff_ms") {
            spec.backoff_ms = backoff;
        }
        spec
    }
}

/// Outcome of `ToolRegistry::resolve`.
#[derive(Clone)]
pub struct ResolvedService {
    pub handler: Arc<dyn ToolHandler>,
    pub config: Arc<ServiceConfig>,
}

/// Process-wide registry mapping URI schemes to handlers and
/// `(tenant, scheme, service)` tuples to configurations.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: DashMap<String, Arc<dyn ToolHandler>>,
    configs: DashMap<(String, String, String), Arc<ServiceConfig>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheme: &str, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(scheme.to_string(), handler);
    }

    pub fn configure(&self, tenant: &str, scheme: &str, service: &str, config: ServiceConfig) {
        self.configs.insert(
            (tenant.to_string(), scheme.to_string(), service.to_string()),
            Arc::new(config),
        );
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.handlers.contains_key(scheme)
    }

    /// Resolve the handler and configuration for a URI. Missing service
    /// configuration yields an empty config; the handler decides whether
    /// that is acceptable.
    pub fn resolve(&self, tenant: &str, scheme: &str, service: &str) -> ToolResult<ResolvedService> {
        let handler = self
            .handlers
            .get(scheme)
            .map(|h| h.value().clone())
            .ok_or_else(|| ToolError::SchemeNotFound(scheme.to_string()))?;
        let config = self
            .configs
            .get(&(tenant.to_string(), scheme.to_string(), service.to_string()))
            .map(|c| c.value().clone())
            .unwrap_or_default();
        Ok(ResolvedService { handler, config })
    }

    /// Invoke the tool addressed by `uri`, enforcing the deadline and
    /// cancellation token around the handler call.
    pub async fn invoke(
        &self,
        tenant: &str,
        uri: &ToolUri,
        args: Value,
        ctx: InvokeContext,
    ) -> ToolResult<ToolOutput> {
        let resolved = self.resolve(tenant, &uri.scheme, &uri.service)?;
        let started = Instant::now();
        let timeout = ctx.remaining();
        let timeout_ms = timeout.as_millis() as u64;

        let call = resolved
            .handler
            .invoke(&uri.service, &resolved.config.config, &uri.path, args, &ctx);

        let value = tokio::select! {
            result = call => result?,
            _ = tokio::time::sleep(timeout) => {
                return Err(ToolError::Timeout(timeout_ms));
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled);
            }
        };

        Ok(ToolOutput {
            value,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Drain all handler connection pools.
    pub async fn shutdown(&self) {
        for entry in self.handlers.iter() {
            entry.value().shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn invoke(
            &self,
            service: &str,
            _config: &Value,
            path: &str,
            args: Value,
            _ctx: &InvokeContext,
        ) -> ToolResult<Value> {
            Ok(serde_json::json!({ "service": service, "path": path, "args": args }))
        }

        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: "echo".to_string(),
                description: "test handler".to_string(),
            }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn invoke(
            &self,
            _service: &str,
            _config: &Value,
            _path: &str,
            _args: Value,
            _ctx: &InvokeContext,
        ) -> ToolResult<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }

        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: "slow".to_string(),
                description: "test handler".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_registry_invoke() {
        let registry = ToolRegistry::new();
        registry.register("api", Arc::new(EchoHandler));

        let uri = ToolUri::parse("api://crm/customer").unwrap();
        let ctx = InvokeContext::new("t1", Duration::from_secs(5));
        let output = registry
            .invoke("t1", &uri, serde_json::json!({"id": 1}), ctx)
            .await
            .unwrap();
        assert_eq!(output.value["service"], "crm");
        assert_eq!(output.value["path"], "customer");
    }

    #[tokio::test]
    async fn test_registry_unknown_scheme() {
        let registry = ToolRegistry::new();
        let uri = ToolUri::parse("nope://x/y").unwrap();
        let ctx = InvokeContext::new("t1", Duration::from_secs(1));
        let err = registry
            .invoke("t1", &uri, Value::Null, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SchemeNotFound(_)));
    }

    #[tokio::test]
    async fn test_registry_deadline_enforced() {
        let registry = ToolRegistry::new();
        registry.register("api", Arc::new(SlowHandler));

        let uri = ToolUri::parse("api://slow/op").unwrap();
        let ctx = InvokeContext::new("t1", Duration::from_millis(50));
        let err = registry
            .invoke("t1", &uri, Value::Null, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_registry_cancellation() {
        let registry = ToolRegistry::new();
        registry.register("api", Arc::new(SlowHandler));

        let uri = ToolUri::parse("api://slow/op").unwrap();
        let ctx = InvokeContext::new("t1", Duration::from_secs(30));
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = registry
            .invoke("t1", &uri, Value::Null, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[test]
    fn test_tool_spec_uri_overrides() {
        let config = ServiceConfig::default();
        let uri = ToolUri::parse("api://svc/op?timeout_ms=1000&max_retries=2").unwrap();
        let spec = config.tool_spec(&uri);
        assert_eq!(spec.timeout_ms, 1000);
        assert_eq!(spec.max_retries, 2);
    }
}
