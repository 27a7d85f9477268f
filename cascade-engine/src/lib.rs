//! # cascade-engine
//!
//! The Cascade flow execution core: parses FDL flow definitions, builds
//! the dependency graph, and drives a concurrency-bounded scheduler that
//! executes nodes in dependency order, emits a typed event stream, and
//! snapshots state for crash recovery.
//!
//! ## Example
//!
//! ```
//! use cascade_engine::{Engine, TenantContext, fdl};
//! use cascade_gml::Object;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let yaml = r#"
//! flow:
//!     name: double
//!     node:
//!         calc:
//!             with: result = x * 2
//! "#;
//! let flow = fdl::parse_flow(yaml).unwrap();
//!
//! let engine = Engine::new();
//! let mut inputs = Object::new();
//! inputs.insert("x".to_string(), cascade_gml::Value::Int(21));
//!
//! let handle = engine
//!     .execute(flow, inputs, TenantContext::new("tenant-1"))
//!     .unwrap();
//! let result = handle.wait().await.unwrap();
//! assert_eq!(
//!     result.output.get("calc").and_then(|v| v.get("result")),
//!     Some(&cascade_gml::Value::Int(42))
//! );
//! # }
//! ```

pub mod approval;
pub mod error;
pub mod event;
pub mod fdl;
pub mod flow;
pub mod graph;
pub mod nodes;
pub mod persistence;
pub mod scheduler;

pub use approval::ApprovalHub;
pub use error::{EngineError, EngineResult, ParseError, SchedulingError};
pub use event::{EventSender, ExecutionEvent, SkipReason};
pub use flow::{Flow, Node, NodeId, NodeKind};
pub use persistence::{
    ExecutionSnapshot, ExecutionStatus, InMemoryBackend, NodeExecutionRecord, NodeState,
    PendingApproval, PersistenceBackend, PersistenceConfig, PersistenceManager,
};
pub use scheduler::{ExecutionOptions, FlowResolver, TenantContext};

use cascade_gml::{Context, Object, Value};
use cascade_tools::ToolRegistry;
use chrono::Utc;
use scheduler::{ExecEnv, GraphRunner, ProgressTracker, RunStatus, project_output};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One running or finished execution, as seen by the embedder.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub output: Value,
    pub error: Option<String>,
    pub error_node: Option<String>,
}

/// Handle to a live execution: the event stream, the cancellation token
/// and the terminal result.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
    pub cancel: CancellationToken,
    task: JoinHandle<ExecutionResult>,
}

impl ExecutionHandle {
    /// Await the terminal result, consuming the handle.
    pub async fn wait(self) -> EngineResult<ExecutionResult> {
        self.task
            .await
            .map_err(|e| EngineError::State(format!("execution task failed: {}", e)))
    }

    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Await the terminal result and drain the buffered event stream.
    pub async fn wait_with_events(self) -> (EngineResult<ExecutionResult>, Vec<ExecutionEvent>) {
        let ExecutionHandle {
            mut events, task, ..
        } = self;
        let result = task
            .await
            .map_err(|e| EngineError::State(format!("execution task failed: {}", e)));
        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        (result, collected)
    }
}

/// The flow execution engine. Owns the tool registry, persistence manager
/// and approval hub; each `execute` spawns an orchestrating task.
pub struct Engine {
    tools: Arc<ToolRegistry>,
    persistence: Arc<PersistenceManager>,
    approvals: Arc<ApprovalHub>,
    options: Arc<ExecutionOptions>,
    flows: Option<Arc<dyn FlowResolver>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with an in-memory persistence backend and an empty tool
    /// registry; suitable for tests and embedding.
    pub fn new() -> Self {
        Self {
            tools: Arc::new(ToolRegistry::new()),
            persistence: Arc::new(PersistenceManager::in_memory()),
            approvals: Arc::new(ApprovalHub::new()),
            options: Arc::new(ExecutionOptions::default()),
            flows: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = Arc::new(options);
        self
    }

    pub fn with_flow_resolver(mut self, flows: Arc<dyn FlowResolver>) -> Self {
        self.flows = Some(flows);
        self
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.clone()
    }

    pub fn persistence(&self) -> Arc<PersistenceManager> {
        self.persistence.clone()
    }

    /// Parse and execute an FDL document in one step.
    pub fn execute_yaml(
        &self,
        yaml: &str,
        inputs: Object,
        tenant: TenantContext,
    ) -> EngineResult<ExecutionHandle> {
        let flow = fdl::parse_flow(yaml).map_err(EngineError::Parse)?;
        self.execute(flow, inputs, tenant)
    }

    /// Validate and start a flow execution. Parse/validation problems are
    /// returned synchronously; the returned handle tracks the rest.
    pub fn execute(
        &self,
        flow: Flow,
        inputs: Object,
        tenant: TenantContext,
    ) -> EngineResult<ExecutionHandle> {
        graph::validate_nodes(&flow.nodes)?;

        let mut ctx = Context::new();
        let inputs_value = Value::Object(inputs.clone());
        seed_inputs(&flow, inputs, &mut ctx)?;
        ctx.set("tenantId", Value::string(tenant.tenant_id.clone()));
        if let Some(vars) = &flow.vars {
            let bindings = cascade_gml::evaluate_bindings(vars, &ctx)?;
            ctx.extend(bindings);
        }

        let execution_id = Uuid::new_v4();
        self.spawn_execution(flow, ctx, tenant, execution_id, inputs_value, None)
    }

    /// Resume a recoverable execution from its latest snapshot. Completed
    /// nodes are not re-run; nodes pending at crash time execute again
    /// (at-least-once for side-effectful tools).
    pub async fn resume(
        &self,
        flow: Flow,
        execution_id: Uuid,
        tenant: TenantContext,
    ) -> EngineResult<ExecutionHandle> {
        let snapshot = self
            .persistence
            .load(execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::State(format!("no snapshot for execution {}", execution_id))
            })?;
        if snapshot.status.is_terminal() {
            return Err(EngineError::State(format!(
                "execution {} already reached {:?}",
                execution_id, snapshot.status
            )));
        }

        graph::validate_nodes(&flow.nodes)?;
        let ctx = Context::from_object(snapshot.variables.clone());
        let inputs = snapshot.inputs.clone();
        self.spawn_execution(flow, ctx, tenant, execution_id, inputs, Some(snapshot))
    }

    /// Resolve a pending approval with the chosen option.
    pub fn resolve_approval(
        &self,
        execution_id: Uuid,
        node_id: &str,
        option_id: impl Into<String>,
    ) -> EngineResult<()> {
        self.approvals.resolve(execution_id, node_id, option_id)
    }

    /// Executions with status running/paused for a tenant.
    pub async fn list_recoverable(&self, tenant_id: &str) -> EngineResult<Vec<Uuid>> {
        self.persistence.list_recoverable(tenant_id).await
    }

    fn spawn_execution(
        &self,
        flow: Flow,
        mut ctx: Context,
        tenant: TenantContext,
        execution_id: Uuid,
        inputs: Value,
        restored: Option<ExecutionSnapshot>,
    ) -> EngineResult<ExecutionHandle> {
        let (events, events_rx) = EventSender::channel();
        let cancel = CancellationToken::new();

        let snapshot = match restored {
            Some(mut snapshot) => {
                snapshot.status = ExecutionStatus::Running;
                snapshot.pending.clear();
                snapshot.current.clear();
                snapshot
            }
            None => {
                let mut snapshot = ExecutionSnapshot::new(
                    execution_id,
                    &flow.meta.name,
                    &tenant.tenant_id,
                    inputs,
                );
                snapshot.status = ExecutionStatus::Running;
                snapshot
            }
        };
        let preset_completed: HashSet<String> = snapshot.completed.iter().cloned().collect();
        let progress = Arc::new(ProgressTracker::new(snapshot, self.persistence.clone()));

        // Servers declared in the flow definition become `mcp://` services
        // for this tenant.
        for server in &flow.mcp_servers {
            self.tools.configure(
                &tenant.tenant_id,
                "mcp",
                &server.id,
                cascade_tools::ServiceConfig::new(serde_json::json!({ "url": server.url })),
            );
        }

        let env = ExecEnv {
            execution_id,
            tenant,
            tools: self.tools.clone(),
            events: events.clone(),
            cancel: cancel.clone(),
            approvals: self.approvals.clone(),
            persistence: self.persistence.clone(),
            options: self.options.clone(),
            progress: progress.clone(),
            flows: self.flows.clone(),
            depth: 0,
        };

        if let Some(timeout) = self.options.timeout {
            let watchdog = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(%execution_id, "execution timed out");
                        watchdog.cancel();
                    }
                    _ = watchdog.cancelled() => {}
                }
            });
        }

        let runner = GraphRunner::new(flow.nodes.clone(), env, true)?
            .with_completed(preset_completed);
        let flow_id = flow.meta.name.clone();

        let task = tokio::spawn(async move {
            events.emit(ExecutionEvent::Start {
                execution_id,
                flow_id: flow_id.clone(),
                at: Utc::now(),
            });
            progress.save_now().await;

            let outcome = runner.run(&mut ctx).await;
            match outcome {
                Ok(outcome) => match outcome.status {
                    RunStatus::Completed => {
                        let output = project_output(&flow, &ctx, &outcome);
                        progress.finalize(ExecutionStatus::Completed);
                        progress.save_now().await;
                        events.emit(ExecutionEvent::Complete {
                            result: output.clone(),
                            at: Utc::now(),
                        });
                        ExecutionResult {
                            execution_id,
                            status: ExecutionStatus::Completed,
                            output,
                            error: None,
                            error_node: None,
                        }
                    }
                    RunStatus::Failed { node_id, error } => {
                        progress.finalize(ExecutionStatus::Failed);
                        progress.save_now().await;
                        events.emit(ExecutionEvent::Failed {
                            error: error.clone(),
                            node_id: Some(node_id.clone()),
                            at: Utc::now(),
                        });
                        ExecutionResult {
                            execution_id,
                            status: ExecutionStatus::Failed,
                            output: Value::Null,
                            error: Some(error),
                            error_node: Some(node_id),
                        }
                    }
                    RunStatus::Cancelled => {
                        progress.finalize(ExecutionStatus::Cancelled);
                        progress.save_now().await;
                        events.emit(ExecutionEvent::Cancelled { at: Utc::now() });
                        ExecutionResult {
                            execution_id,
                            status: ExecutionStatus::Cancelled,
                            output: Value::Null,
                            error: None,
                            error_node: None,
                        }
                    }
                },
                Err(e) => {
                    let message = e.to_string();
                    progress.finalize(ExecutionStatus::Failed);
                    progress.save_now().await;
                    events.emit(ExecutionEvent::Failed {
                        error: message.clone(),
                        node_id: e.node_id().map(str::to_string),
                        at: Utc::now(),
                    });
                    ExecutionResult {
                        execution_id,
                        status: ExecutionStatus::Failed,
                        output: Value::Null,
                        error: Some(message),
                        error_node: e.node_id().map(str::to_string),
                    }
                }
            }
        });

        Ok(ExecutionHandle {
            execution_id,
            events: events_rx,
            cancel,
            task,
        })
    }
}

/// Match declared inputs against provided values: fill defaults (GML
/// expressions), validate declared types, reject missing required params.
/// Undeclared inputs pass through untouched.
fn seed_inputs(flow: &Flow, inputs: Object, ctx: &mut Context) -> EngineResult<()> {
    let declared: HashSet<&str> = flow.args.inputs.iter().map(|p| p.name.as_str()).collect();

    for param in &flow.args.inputs {
        let value = match inputs.get(&param.name) {
            Some(value) => {
                if !param.ty.accepts(value) {
                    return Err(EngineError::Validation(format!(
                        "input '{}' has wrong type (got {})",
                        param.name,
                        value.type_name()
                    )));
                }
                value.clone()
            }
            None => match &param.default {
                Some(source) => {
                    cascade_gml::evaluate(source, &Context::new()).map_err(|e| {
                        EngineError::Validation(format!(
                            "default for input '{}' failed: {}",
                            param.name, e
                        ))
                    })?
                }
                None if param.ty.nullable => Value::Null,
                None => {
                    return Err(EngineError::Validation(format!(
                        "missing required input '{}'",
                        param.name
                    )));
                }
            },
        };
        ctx.set(param.name.clone(), value);
    }

    for (name, value) in inputs {
        if !declared.contains(name.as_str()) {
            ctx.set(name, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_yaml(yaml: &str, inputs: Object) -> ExecutionResult {
        Engine::new()
            .execute_yaml(yaml, inputs, TenantContext::new("t1"))
            .unwrap()
            .wait()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_simple_mapping_flow() {
        let result = run_yaml(
            r#"
flow:
    name: compute
    node:
        calc:
            with: result = 1 + 2
"#,
            Object::new(),
        )
        .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(
            result.output.get("calc").and_then(|v| v.get("result")),
            Some(&Value::Int(3))
        );
    }

    #[tokio::test]
    async fn test_linear_chain_sees_upstream_outputs() {
        let result = run_yaml(
            r#"
flow:
    name: chain
    node:
        step1:
            with: a = 10
            next: step2
        step2:
            with: b = step1.a * 2
            next: step3
        step3:
            with: c = step2.b + 5
"#,
            Object::new(),
        )
        .await;
        assert_eq!(
            result.output.get("step3").and_then(|v| v.get("c")),
            Some(&Value::Int(25))
        );
    }

    #[test]
    fn test_missing_required_input_rejected() {
        let engine = Engine::new();
        let flow = fdl::parse_flow(
            r#"
flow:
    name: needs-input
    args:
        in:
            customerId: string
    node:
        noop:
            with: customerId
"#,
        )
        .unwrap();
        let err = engine
            .execute(flow, Object::new(), TenantContext::new("t1"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_input_type_validation() {
        let engine = Engine::new();
        let flow = fdl::parse_flow(
            r#"
flow:
    name: typed
    args:
        in:
            count: int
    node:
        noop:
            with: count
"#,
        )
        .unwrap();
        let mut inputs = Object::new();
        inputs.insert("count".to_string(), Value::string("three"));
        assert!(matches!(
            engine.execute(flow, inputs, TenantContext::new("t1")),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_default_inputs_evaluated() {
        let result = run_yaml(
            r#"
flow:
    name: defaults
    args:
        in:
            factor: "int = 2 + 1"
    node:
        calc:
            with: result = factor * 2
"#,
            Object::new(),
        )
        .await;
        assert_eq!(
            result.output.get("calc").and_then(|v| v.get("result")),
            Some(&Value::Int(6))
        );
    }

    #[tokio::test]
    async fn test_only_skips_but_downstream_runs() {
        let result = run_yaml(
            r#"
flow:
    name: only
    node:
        setup:
            with: skip = true
            next: maybe
        maybe:
            only: "!setup.skip"
            with: ran = true
            next: final
        final:
            with: done = true
"#,
            Object::new(),
        )
        .await;
        assert!(result.output.get("maybe").is_none());
        assert_eq!(
            result.output.get("final").and_then(|v| v.get("done")),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_switch_routes_single_case() {
        let result = run_yaml(
            r#"
flow:
    name: switch
    node:
        setup:
            with: value = 2
            next: route
        route:
            case:
                - when: setup.value == 1
                  then: one
                - when: setup.value == 2
                  then: two
            else: fallback
        one:
            with: "'one'"
        two:
            with: "'two'"
        fallback:
            with: "'fallback'"
"#,
            Object::new(),
        )
        .await;
        assert_eq!(result.output.get("two"), Some(&Value::string("two")));
        assert!(result.output.get("one").is_none());
        assert!(result.output.get("fallback").is_none());
    }

    #[tokio::test]
    async fn test_output_projection() {
        let result = run_yaml(
            r#"
flow:
    name: projected
    args:
        out:
            total: int
    node:
        calc:
            sets: total = 40 + 2
            with: "null"
"#,
            Object::new(),
        )
        .await;
        assert_eq!(result.output.get("total"), Some(&Value::Int(42)));
        assert!(result.output.get("calc").is_none());
    }

    #[test]
    fn test_validation_failure_is_synchronous() {
        let engine = Engine::new();
        let flow = fdl::parse_flow(
            r#"
flow:
    name: bad-ref
    node:
        a:
            with: "1"
            next: ghost
"#,
        )
        .unwrap();
        assert!(matches!(
            engine.execute(flow, Object::new(), TenantContext::new("t1")),
            Err(EngineError::Validation(_))
        ));
    }
}
