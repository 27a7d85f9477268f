//! # cascade-tools
//!
//! Tool adapters for the Cascade flow engine. An Exec node addresses an
//! external side effect with a tool URI (`<scheme>://<service>/<path>?opts`);
//! this crate resolves the URI to a handler, manages per-service connection
//! handles with LRU eviction, and enforces the deadline/cancellation
//! contract on every invocation.

pub mod agent;
pub mod api;
pub mod db;
pub mod error;
pub mod mail;
pub mod mcp;
pub mod mq;
pub mod oss;
pub mod registry;
pub mod sms;
pub mod svc;

pub use agent::{AgentHandler, AgentRequest, AgentResponse, AgentRuntime, MockAgentRuntime};
pub use error::{ToolError, ToolResult};
pub use mcp::{HttpMcpClient, McpClient, McpHandler};
pub use registry::{ResolvedService, ServiceConfig, ToolHandler, ToolMetadata, ToolRegistry, ToolSpec};

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Parsed tool URI: `<scheme>://<service>/<path>?<opts>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUri {
    pub scheme: String,
    pub service: String,
    pub path: String,
    pub options: HashMap<String, String>,
}

impl ToolUri {
    pub fn parse(uri: &str) -> ToolResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ToolError::InvalidUri(format!("missing scheme: {}", uri)))?;
        if scheme.is_empty() {
            return Err(ToolError::InvalidUri(format!("empty scheme: {}", uri)));
        }

        let (location, query) = match rest.split_once('?') {
            Some((l, q)) => (l, Some(q)),
            None => (rest, None),
        };

        let (service, path) = match location.split_once('/') {
            Some((s, p)) => (s, p),
            None => (location, ""),
        };
        if service.is_empty() {
            return Err(ToolError::InvalidUri(format!("empty service: {}", uri)));
        }

        let options = query
            .map(|q| {
                q.split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            scheme: scheme.to_string(),
            service: service.to_string(),
            path: path.to_string(),
            options,
        })
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.parse().ok())
    }
}

/// Per-invocation context: tenant identity, absolute deadline and the
/// execution's cancellation token. Handlers must return before the deadline
/// or fail with `Timeout`, and must observe `cancel` at suspension points.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub tenant_id: String,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub metadata: HashMap<String, String>,
}

impl InvokeContext {
    pub fn new(tenant_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Time left until the deadline; zero when already past it.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub value: Value,
    pub duration_ms: u64,
}

/// Process-wide handle cache keyed by `(tenant, service)`, shared by the
/// handlers for their connection pools. Entries are created lazily, touched
/// on use, evicted least-recently-used beyond `capacity` and dropped after
/// `idle_window` without use.
pub struct HandleCache<T: Clone + Send + Sync + 'static> {
    entries: DashMap<String, CacheEntry<T>>,
    capacity: usize,
    idle_window: Duration,
}

#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    last_used: Instant,
}

impl<T: Clone + Send + Sync + 'static> HandleCache<T> {
    pub fn new(capacity: usize, idle_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            idle_window,
        }
    }

    pub fn key(tenant: &str, service: &str) -> String {
        format!("{}:{}", tenant, service)
    }

    /// Fetch a cached handle or create one with `create`. Creation is not
    /// globally serialized; a racing duplicate is dropped on insert.
    pub async fn get_or_create<F, Fut>(&self, key: &str, create: F) -> ToolResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ToolResult<T>>,
    {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_used = Instant::now();
            return Ok(entry.value.clone());
        }

        let value = create().await?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                last_used: Instant::now(),
            },
        );
        self.evict();
        Ok(value)
    }

    fn evict(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_used) < self.idle_window);

        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_used)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all handles (shutdown path).
    pub fn drain(&self) {
        self.entries.clear();
    }
}

impl<T: Clone + Send + Sync + 'static> Default for HandleCache<T> {
    fn default() -> Self {
        Self::new(64, Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_uri() {
        let uri = ToolUri::parse("api://crm-service/customer?timeout_ms=5000").unwrap();
        assert_eq!(uri.scheme, "api");
        assert_eq!(uri.service, "crm-service");
        assert_eq!(uri.path, "customer");
        assert_eq!(uri.option_u64("timeout_ms"), Some(5000));
    }

    #[test]
    fn test_parse_uri_nested_path() {
        let uri = ToolUri::parse("db://ec.mysql.order/count").unwrap();
        assert_eq!(uri.scheme, "db");
        assert_eq!(uri.service, "ec.mysql.order");
        assert_eq!(uri.path, "count");
    }

    #[test]
    fn test_parse_uri_no_path() {
        let uri = ToolUri::parse("mq://orders").unwrap();
        assert_eq!(uri.service, "orders");
        assert_eq!(uri.path, "");
    }

    #[test]
    fn test_parse_uri_multiple_options() {
        let uri = ToolUri::parse("api://svc/m?max_retries=3&backoff_ms=200").unwrap();
        assert_eq!(uri.option_u64("max_retries"), Some(3));
        assert_eq!(uri.option_u64("backoff_ms"), Some(200));
    }

    #[test]
    fn test_parse_uri_rejects_malformed() {
        assert!(ToolUri::parse("no-scheme").is_err());
        assert!(ToolUri::parse("://svc/x").is_err());
        assert!(ToolUri::parse("api:///x").is_err());
    }

    #[tokio::test]
    async fn test_handle_cache_reuses_and_evicts() {
        let cache: HandleCache<u32> = HandleCache::new(2, Duration::from_secs(60));

        let a = cache.get_or_create("a", || async { Ok(1u32) }).await.unwrap();
        assert_eq!(a, 1);
        // Second fetch does not re-run the factory.
        let a2 = cache
            .get_or_create("a", || async { panic!("factory re-run") })
            .await
            .unwrap();
        assert_eq!(a2, 1);

        cache.get_or_create("b", || async { Ok(2u32) }).await.unwrap();
        cache.get_or_create("c", || async { Ok(3u32) }).await.unwrap();
        assert!(cache.len() <= 2);
    }

    #[tokio::test]
    async fn test_handle_cache_drain() {
        let cache: HandleCache<u32> = HandleCache::default();
        cache.get_or_create("a", || async { Ok(1u32) }).await.unwrap();
        cache.drain();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invoke_context_remaining() {
        let ctx = InvokeContext::new("t1", Duration::from_secs(30));
        assert!(ctx.remaining() <= Duration::from_secs(30));
        assert!(ctx.remaining() > Duration::from_secs(29));
    }
}
