//! Parallel dataflow scheduler.
//!
//! One orchestrating task per (sub-)graph owns the context and the
//! bookkeeping; node executions are spawned onto a `JoinSet` and report
//! back a [`NodeResult`]. Edge resolution drives readiness:
//!
//! - a completed node resolves its sequential edges live and its branch
//!   edges live only along the taken branch;
//! - an `only`-skipped node resolves all outgoing edges live (downstream
//!   dependency accounting treats it as completed);
//! - dead resolutions propagate: a node whose incoming edges all resolved
//!   dead is skipped recursively;
//! - failure edges resolve live only when their source fails, and a
//!   failed node kills its other outgoing edges.
//!
//! A node is ready when every mandatory predecessor has resolved with at
//! least one live edge (convergence points therefore wait for all of
//! them), or when a failure edge aimed at it went live.

use crate::approval::ApprovalHub;
use crate::error::{EngineError, EngineResult, SchedulingError};
use crate::event::{EventSender, ExecutionEvent, SkipReason};
use crate::flow::{Flow, Node, NodeId, NodeKind, OutputDef};
use crate::graph::{DepGraph, EdgeKind};
use crate::nodes::{self, NodeResult, evaluator};
use crate::persistence::{
    ExecutionSnapshot, ExecutionStatus, NodeExecutionRecord, NodeState, PersistenceManager,
};
use cascade_gml::{Context, Object, Value};
use cascade_tools::ToolRegistry;
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Variables stamped by the engine and stripped from user-facing output.
const SYSTEM_VARS: &[&str] = &["tenantId"];

/// Tenant identity stamped on every execution. The scheduler consumes it;
/// quota and auth enforcement happen outside the core.
#[derive(Debug, Clone, Default)]
pub struct TenantContext {
    pub tenant_id: String,
    pub metadata: HashMap<String, String>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Looks up flows referenced by `flow://` exec URIs.
pub trait FlowResolver: Send + Sync {
    fn resolve(&self, flow_id: &str) -> Option<Flow>;
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Concurrent node executions per graph run.
    pub max_parallel: usize,
    /// Wall-clock budget for the whole execution.
    pub timeout: Option<Duration>,
    pub loop_max_iterations: u32,
    /// How long to wait for in-flight nodes after a cancel.
    pub drain_timeout: Duration,
    pub max_subflow_depth: u32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_parallel: 64,
            timeout: None,
            loop_max_iterations: 10_000,
            drain_timeout: Duration::from_secs(30),
            max_subflow_depth: 16,
        }
    }
}

/// Everything a node execution needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub(crate) struct ExecEnv {
    pub execution_id: Uuid,
    pub tenant: TenantContext,
    pub tools: Arc<ToolRegistry>,
    pub events: EventSender,
    pub cancel: CancellationToken,
    pub approvals: Arc<ApprovalHub>,
    pub persistence: Arc<PersistenceManager>,
    pub options: Arc<ExecutionOptions>,
    pub progress: Arc<ProgressTracker>,
    pub flows: Option<Arc<dyn FlowResolver>>,
    pub depth: u32,
}

impl ExecEnv {
    /// Clone for a nested sub-flow, enforcing the recursion guard.
    pub fn deeper(&self) -> EngineResult<ExecEnv> {
        if self.depth + 1 > self.options.max_subflow_depth {
            return Err(SchedulingError::InvalidGraph(format!(
                "sub-flow nesting exceeds {} levels",
                self.options.max_subflow_depth
            ))
            .into());
        }
        let mut env = self.clone();
        env.depth += 1;
        Ok(env)
    }
}

/// Shared view of the execution's progress: status, node sets, history and
/// the snapshot cadence. Locked briefly; only ever touched between
/// suspension points.
pub(crate) struct ProgressTracker {
    state: StdMutex<ExecutionSnapshot>,
    manager: Arc<PersistenceManager>,
    since_snapshot: AtomicU32,
}

impl ProgressTracker {
    pub fn new(snapshot: ExecutionSnapshot, manager: Arc<PersistenceManager>) -> Self {
        Self {
            state: StdMutex::new(snapshot),
            manager,
            since_snapshot: AtomicU32::new(0),
        }
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        let mut state = self.state.lock().unwrap();
        // Terminal states only ever see updated_at move.
        if !state.status.is_terminal() {
            state.status = status;
        }
        state.updated_at = Utc::now();
    }

    pub fn node_dispatched(&self, node_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(node_id.to_string());
        state.current.insert(node_id.to_string());
        state.updated_at = Utc::now();
    }

    pub fn node_finished(&self, record: NodeExecutionRecord, variables: &Object) {
        let completed = record.state == NodeState::Completed;
        {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(&record.node_id);
            state.current.remove(&record.node_id);
            if completed {
                state.completed.insert(record.node_id.clone());
            }
            state.variables = variables.clone();
            state.history.push(record);
            state.updated_at = Utc::now();
        }

        if completed {
            let count = self.since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
            if self.manager.should_snapshot(count) {
                self.since_snapshot.store(0, Ordering::Relaxed);
                self.manager.save_async(self.snapshot());
            }
        }
    }

    pub fn set_error(&self, node_id: &str, error: &str) {
        let mut state = self.state.lock().unwrap();
        state.error = Some(error.to_string());
        state.error_node = Some(node_id.to_string());
        state.updated_at = Utc::now();
    }

    pub fn finalize(&self, status: ExecutionStatus) {
        let mut state = self.state.lock().unwrap();
        if !state.status.is_terminal() {
            state.status = status;
        }
        state.completed_at = Some(Utc::now());
        state.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.state.lock().unwrap().clone()
    }

    /// Synchronous write for pause/terminal points; failures are logged
    /// (the manager already retried).
    pub async fn save_now(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.manager.save(&snapshot).await {
            tracing::warn!(execution_id = %snapshot.execution_id, error = %e, "snapshot save failed");
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RunStatus {
    Completed,
    Failed { node_id: String, error: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct RunOutcome {
    pub status: RunStatus,
    /// Outputs of completed terminal nodes, in declaration order.
    pub leaf_outputs: Object,
}

impl RunOutcome {
    /// Collapse into a single result value or error, applying the flow's
    /// declared output shape.
    pub fn to_result(&self, flow: &Flow, ctx: &Context) -> EngineResult<Value> {
        match &self.status {
            RunStatus::Completed => Ok(project_output(flow, ctx, self)),
            RunStatus::Failed { node_id, error } => Err(EngineError::at_node(
                node_id.clone(),
                EngineError::State(error.clone()),
            )),
            RunStatus::Cancelled => Err(EngineError::Cancelled),
        }
    }
}

/// Shape the final output per `args.out`: named params are projected from
/// the context, a single type takes the lone leaf output, and no
/// declaration returns the full variable set minus system variables.
pub(crate) fn project_output(flow: &Flow, ctx: &Context, outcome: &RunOutcome) -> Value {
    match &flow.args.output {
        Some(OutputDef::Params(params)) => Value::Object(
            params
                .iter()
                .map(|p| {
                    (
                        p.name.clone(),
                        ctx.get(&p.name).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect(),
        ),
        Some(OutputDef::Single(_)) => {
            let mut leaves = outcome.leaf_outputs.clone();
            match leaves.len() {
                1 => leaves.shift_remove_index(0).unwrap().1,
                _ => Value::Object(leaves),
            }
        }
        None => {
            let mut vars = ctx.variables().clone();
            for system in SYSTEM_VARS {
                vars.shift_remove(*system);
            }
            Value::Object(vars)
        }
    }
}

#[derive(Default)]
struct Tracking {
    m_resolved: usize,
    m_live: usize,
    f_resolved: usize,
    f_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Done {
    Completed,
    FailedHandled,
    Skipped,
}

enum Resolution<'a> {
    Completed { taken: Option<&'a [NodeId]> },
    SkippedLive,
    SkippedDead,
    Failed,
}

/// Executes one node graph (a flow or a sub-flow body) to completion.
pub(crate) struct GraphRunner {
    nodes: IndexMap<NodeId, Node>,
    graph: DepGraph,
    env: ExecEnv,
    /// Only the root runner writes history and node sets to the tracker.
    record_history: bool,
    /// Nodes already completed before this run (crash recovery).
    preset_completed: HashSet<NodeId>,
}

impl GraphRunner {
    pub fn new(
        nodes: IndexMap<NodeId, Node>,
        env: ExecEnv,
        record_history: bool,
    ) -> EngineResult<Self> {
        let graph = DepGraph::build(&nodes)?;
        Ok(Self {
            nodes,
            graph,
            env,
            record_history,
            preset_completed: HashSet::new(),
        })
    }

    pub fn with_completed(mut self, completed: HashSet<NodeId>) -> Self {
        self.preset_completed = completed;
        self
    }

    pub async fn run(&self, ctx: &mut Context) -> EngineResult<RunOutcome> {
        let mut tracking: HashMap<NodeId, Tracking> = self
            .nodes
            .keys()
            .map(|id| (id.clone(), Tracking::default()))
            .collect();
        let mut done: HashMap<NodeId, Done> = HashMap::new();
        let mut running: HashSet<NodeId> = HashSet::new();
        let mut joinset: JoinSet<(
            NodeId,
            chrono::DateTime<Utc>,
            Instant,
            EngineResult<NodeResult>,
        )> = JoinSet::new();
        let mut failure: Option<(NodeId, String)> = None;
        let mut cancelled = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        // Crash recovery: replay the edge resolution of nodes that already
        // completed in a previous incarnation.
        for id in &self.preset_completed {
            if !self.nodes.contains_key(id) {
                continue;
            }
            done.insert(id.clone(), Done::Completed);
        }
        for id in &self.preset_completed {
            if let Some(node) = self.nodes.get(id) {
                let taken = self.replay_route(id, node, ctx);
                self.resolve_outgoing(
                    id,
                    Resolution::Completed {
                        taken: taken.as_deref(),
                    },
                    &mut tracking,
                );
            }
        }
        self.propagate_dead(&mut tracking, &mut done, &running);

        loop {
            if !cancelled && failure.is_none() {
                while running.len() < self.env.options.max_parallel && failure.is_none() {
                    let Some(node_id) = self.find_ready(&tracking, &done, &running) else {
                        break;
                    };
                    let node = &self.nodes[&node_id];

                    if let Some(only) = &node.base.only {
                        match evaluator().evaluate_bool(only, ctx) {
                            Ok(true) => {}
                            Ok(false) => {
                                self.mark_skipped(
                                    &node_id,
                                    SkipReason::OnlyFalse,
                                    &mut done,
                                    &mut tracking,
                                    &running,
                                );
                                continue;
                            }
                            Err(e) => {
                                self.handle_node_error(
                                    &node_id,
                                    EngineError::from(e),
                                    &mut done,
                                    &mut tracking,
                                    &running,
                                    &mut failure,
                                );
                                continue;
                            }
                        }
                    }

                    running.insert(node_id.clone());
                    if self.record_history {
                        self.env.progress.node_dispatched(&node_id);
                    }

                    let node = node.clone();
                    let env = self.env.clone();
                    let scope = Arc::new(ctx.clone());
                    let id = node_id.clone();
                    joinset.spawn(async move {
                        let started_wall = Utc::now();
                        let started = Instant::now();
                        let result = nodes::run_node(&id, &node, scope, &env).await;
                        (id, started_wall, started, result)
                    });
                }
            }

            if running.is_empty() {
                break;
            }

            let joined = if cancelled {
                let deadline = drain_deadline
                    .unwrap_or_else(|| tokio::time::Instant::now() + self.env.options.drain_timeout);
                match tokio::time::timeout_at(deadline, joinset.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(
                            execution_id = %self.env.execution_id,
                            "drain deadline reached, aborting in-flight nodes"
                        );
                        joinset.abort_all();
                        running.clear();
                        break;
                    }
                }
            } else {
                tokio::select! {
                    _ = self.env.cancel.cancelled() => {
                        cancelled = true;
                        drain_deadline = Some(
                            tokio::time::Instant::now() + self.env.options.drain_timeout,
                        );
                        continue;
                    }
                    joined = joinset.join_next() => joined,
                }
            };

            let Some(join_result) = joined else {
                // Join set drained while the running set disagrees; resync
                // rather than spin.
                running.clear();
                continue;
            };
            let (node_id, started_wall, started, result) = match join_result {
                Ok(completion) => completion,
                Err(join_error) => {
                    failure = Some((
                        "<scheduler>".to_string(),
                        format!("node task aborted: {}", join_error),
                    ));
                    continue;
                }
            };
            running.remove(&node_id);

            match result {
                Ok(node_result) => {
                    // Context writes happen here, on the orchestrating
                    // task, between dispatches.
                    if let Some(output) = &node_result.output {
                        ctx.set(node_id.clone(), output.clone());
                    }
                    for (key, value) in &node_result.sets {
                        ctx.set(key.clone(), value.clone());
                    }

                    done.insert(node_id.clone(), Done::Completed);
                    self.env.events.emit(ExecutionEvent::NodeComplete {
                        node_id: node_id.clone(),
                        output: node_result.output.clone().unwrap_or(Value::Null),
                        duration_ms: started.elapsed().as_millis() as u64,
                        at: Utc::now(),
                    });
                    if self.record_history {
                        self.env.progress.node_finished(
                            NodeExecutionRecord {
                                node_id: node_id.clone(),
                                started_at: started_wall,
                                ended_at: Some(Utc::now()),
                                state: NodeState::Completed,
                                input: node_result.input.clone(),
                                output: node_result.output.clone(),
                                error: None,
                            },
                            ctx.variables(),
                        );
                    }

                    self.resolve_outgoing(
                        &node_id,
                        Resolution::Completed {
                            taken: node_result.taken.as_deref(),
                        },
                        &mut tracking,
                    );
                    self.propagate_dead(&mut tracking, &mut done, &running);
                }
                Err(EngineError::Cancelled) => {
                    // Cancelled mid-flight; the execution is winding down.
                    cancelled = true;
                    drain_deadline.get_or_insert_with(|| {
                        tokio::time::Instant::now() + self.env.options.drain_timeout
                    });
                    done.insert(node_id.clone(), Done::Skipped);
                    if self.record_history {
                        self.env.progress.node_finished(
                            NodeExecutionRecord {
                                node_id: node_id.clone(),
                                started_at: started_wall,
                                ended_at: Some(Utc::now()),
                                state: NodeState::Skipped,
                                input: Value::Null,
                                output: None,
                                error: Some("cancelled".to_string()),
                            },
                            ctx.variables(),
                        );
                    }
                }
                Err(err) => {
                    if self.record_history {
                        let state = if self.nodes[&node_id].base.fail.is_some() {
                            NodeState::FailedHandled
                        } else {
                            NodeState::Failed
                        };
                        self.env.progress.node_finished(
                            NodeExecutionRecord {
                                node_id: node_id.clone(),
                                started_at: started_wall,
                                ended_at: Some(Utc::now()),
                                state,
                                input: Value::Null,
                                output: None,
                                error: Some(err.to_string()),
                            },
                            ctx.variables(),
                        );
                    }
                    self.handle_node_error(
                        &node_id,
                        err,
                        &mut done,
                        &mut tracking,
                        &running,
                        &mut failure,
                    );
                }
            }
        }

        // Anything never resolved (e.g. untriggered failure handlers).
        for id in self.nodes.keys() {
            if !done.contains_key(id) && !running.contains(id) {
                self.env.events.emit(ExecutionEvent::NodeSkipped {
                    node_id: id.clone(),
                    reason: SkipReason::NotTriggered,
                });
                if self.record_history {
                    self.record_skip(id, ctx);
                }
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if let Some((node_id, error)) = failure {
            RunStatus::Failed { node_id, error }
        } else {
            RunStatus::Completed
        };

        Ok(RunOutcome {
            leaf_outputs: self.collect_leaves(ctx, &done),
            status,
        })
    }

    fn find_ready(
        &self,
        tracking: &HashMap<NodeId, Tracking>,
        done: &HashMap<NodeId, Done>,
        running: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        for id in self.nodes.keys() {
            if done.contains_key(id) || running.contains(id) {
                continue;
            }
            let t = &tracking[id];
            let in_degree = self.graph.in_degree[id];
            let fail_in = self.graph.fail_in_degree[id];

            let ready = t.f_live
                || (in_degree == 0 && fail_in == 0)
                || (in_degree > 0 && t.m_resolved == in_degree && t.m_live > 0);
            if ready {
                return Some(id.clone());
            }
        }
        None
    }

    fn resolve_outgoing(
        &self,
        node_id: &str,
        resolution: Resolution<'_>,
        tracking: &mut HashMap<NodeId, Tracking>,
    ) {
        for edge in &self.graph.forward[node_id] {
            let live = match (edge.kind, &resolution) {
                (EdgeKind::Failure, Resolution::Failed) => true,
                (EdgeKind::Failure, _) => false,
                (_, Resolution::Failed) => false,
                (_, Resolution::SkippedDead) => false,
                (EdgeKind::Sequential, _) => true,
                (EdgeKind::Branch, Resolution::Completed { taken: Some(taken) }) => {
                    taken.contains(&edge.to)
                }
                // A skipped-live node satisfies its branch successors, and
                // a non-branching completion has no selective routing.
                (EdgeKind::Branch, _) => true,
            };
            let t = tracking.get_mut(&edge.to).expect("edge target tracked");
            match edge.kind {
                EdgeKind::Failure => {
                    t.f_resolved += 1;
                    if live {
                        t.f_live = true;
                    }
                }
                _ => {
                    t.m_resolved += 1;
                    if live {
                        t.m_live += 1;
                    }
                }
            }
        }
    }

    /// Recursively skip nodes whose every incoming edge resolved dead.
    fn propagate_dead(
        &self,
        tracking: &mut HashMap<NodeId, Tracking>,
        done: &mut HashMap<NodeId, Done>,
        running: &HashSet<NodeId>,
    ) {
        loop {
            let mut dead: Vec<NodeId> = Vec::new();
            for id in self.nodes.keys() {
                if done.contains_key(id) || running.contains(id) {
                    continue;
                }
                let in_degree = self.graph.in_degree[id];
                let fail_in = self.graph.fail_in_degree[id];
                if in_degree + fail_in == 0 {
                    continue;
                }
                let t = &tracking[id];
                if t.m_resolved == in_degree
                    && t.f_resolved == fail_in
                    && t.m_live == 0
                    && !t.f_live
                {
                    dead.push(id.clone());
                }
            }
            if dead.is_empty() {
                return;
            }
            for id in dead {
                done.insert(id.clone(), Done::Skipped);
                self.env.events.emit(ExecutionEvent::NodeSkipped {
                    node_id: id.clone(),
                    reason: SkipReason::BranchNotTaken,
                });
                if self.record_history {
                    self.env.progress.node_finished(
                        NodeExecutionRecord {
                            node_id: id.clone(),
                            started_at: Utc::now(),
                            ended_at: Some(Utc::now()),
                            state: NodeState::Skipped,
                            input: Value::Null,
                            output: None,
                            error: None,
                        },
                        &Object::new(),
                    );
                }
                self.resolve_outgoing(&id, Resolution::SkippedDead, tracking);
            }
        }
    }

    /// `only`-skip: the node does not run, downstream proceeds.
    fn mark_skipped(
        &self,
        node_id: &str,
        reason: SkipReason,
        done: &mut HashMap<NodeId, Done>,
        tracking: &mut HashMap<NodeId, Tracking>,
        running: &HashSet<NodeId>,
    ) {
        done.insert(node_id.to_string(), Done::Skipped);
        self.env.events.emit(ExecutionEvent::NodeSkipped {
            node_id: node_id.to_string(),
            reason,
        });
        if self.record_history {
            self.env.progress.node_finished(
                NodeExecutionRecord {
                    node_id: node_id.to_string(),
                    started_at: Utc::now(),
                    ended_at: Some(Utc::now()),
                    state: NodeState::Skipped,
                    input: Value::Null,
                    output: None,
                    error: None,
                },
                &Object::new(),
            );
        }
        self.resolve_outgoing(node_id, Resolution::SkippedLive, tracking);
        self.propagate_dead(tracking, done, running);
    }

    fn handle_node_error(
        &self,
        node_id: &str,
        error: EngineError,
        done: &mut HashMap<NodeId, Done>,
        tracking: &mut HashMap<NodeId, Tracking>,
        running: &HashSet<NodeId>,
        failure: &mut Option<(NodeId, String)>,
    ) {
        let message = error.to_string();
        self.env.events.emit(ExecutionEvent::NodeFailed {
            node_id: node_id.to_string(),
            error: message.clone(),
            input: Value::Null,
            at: Utc::now(),
        });

        let node = &self.nodes[node_id];
        if node.base.fail.is_some() {
            tracing::info!(node_id, error = %message, "node failed, routing to fail handler");
            done.insert(node_id.to_string(), Done::FailedHandled);
            self.resolve_outgoing(node_id, Resolution::Failed, tracking);
            self.propagate_dead(tracking, done, running);
        } else {
            tracing::error!(node_id, error = %message, "node failed, no handler");
            done.insert(node_id.to_string(), Done::Skipped);
            if self.record_history {
                self.env.progress.set_error(node_id, &message);
            }
            *failure = Some((node_id.to_string(), message));
        }
    }

    fn record_skip(&self, node_id: &str, ctx: &Context) {
        self.env.progress.node_finished(
            NodeExecutionRecord {
                node_id: node_id.to_string(),
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
                state: NodeState::Skipped,
                input: Value::Null,
                output: None,
                error: None,
            },
            ctx.variables(),
        );
    }

    /// Outputs of completed nodes with no (non-failure) outgoing edges.
    fn collect_leaves(&self, ctx: &Context, done: &HashMap<NodeId, Done>) -> Object {
        let mut leaves = Object::new();
        for id in self.nodes.keys() {
            if !matches!(done.get(id), Some(Done::Completed)) {
                continue;
            }
            let terminal = self.graph.forward[id]
                .iter()
                .all(|edge| edge.kind == EdgeKind::Failure);
            if terminal && let Some(value) = ctx.get(id) {
                leaves.insert(id.clone(), value.clone());
            }
        }
        leaves
    }

    /// Re-derive the branch a previously-completed routing node took, for
    /// resume: conditions and switches re-evaluate their (pure) guards
    /// against the restored context; guard and approval nodes read their
    /// bound output back.
    fn replay_route(&self, node_id: &str, node: &Node, ctx: &Context) -> Option<Vec<NodeId>> {
        match &node.kind {
            NodeKind::Condition(n) => match evaluator().evaluate_bool(&n.when, ctx) {
                Ok(true) => Some(vec![n.then.clone()]),
                Ok(false) => Some(n.r#else.iter().cloned().collect()),
                Err(_) => None,
            },
            NodeKind::Switch(n) => {
                for case in &n.cases {
                    match evaluator().evaluate_bool(&case.when, ctx) {
                        Ok(true) => return Some(vec![case.then.clone()]),
                        Ok(false) => {}
                        Err(_) => return None,
                    }
                }
                Some(n.r#else.iter().cloned().collect())
            }
            NodeKind::Guard(n) => {
                let output = ctx.get(node_id)?;
                let blocked = !output.get("passed").and_then(Value::as_bool).unwrap_or(true)
                    && output.get("action").and_then(Value::as_str) == Some("block");
                if blocked {
                    Some(n.r#else.iter().cloned().collect())
                } else {
                    Some(n.then.iter().cloned().collect())
                }
            }
            NodeKind::Approval(n) => {
                let option_id = ctx.get(node_id)?.as_str()?.to_string();
                if n.approval.approves(&option_id) {
                    Some(n.then.iter().cloned().collect())
                } else {
                    Some(n.r#else.iter().cloned().collect())
                }
            }
            _ => None,
        }
    }
}
