//! Node executors, dispatched by node tag.
//!
//! Executors receive an immutable context snapshot (the scope) and return a
//! [`NodeResult`]; the orchestrating task alone applies the writes. That
//! keeps the context single-writer without locks on the hot path.

mod agent;
mod approval;
mod condition;
mod delay;
mod each;
mod exec;
mod guard;
mod handoff;
mod r#loop;
mod mapping;
mod mcp;
mod switch;

pub(crate) use delay::parse_duration;

use crate::error::{EngineError, EngineResult};
use crate::flow::{Node, NodeId, NodeKind};
use crate::scheduler::ExecEnv;
use cascade_gml::{Context, Evaluator, Object, Value};
use chrono::Utc;
use once_cell::sync::Lazy;
use std::sync::Arc;

static EVALUATOR: Lazy<Evaluator> = Lazy::new(Evaluator::new);

pub(crate) fn evaluator() -> &'static Evaluator {
    &EVALUATOR
}

/// What a node executor hands back to the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct NodeResult {
    /// Evaluated input, recorded in history for debugging.
    pub input: Value,
    /// Value bound under the node ID in the context.
    pub output: Option<Value>,
    /// Additional context writes from `sets`.
    pub sets: Object,
    /// Chosen branch targets for branching nodes; `None` means all
    /// sequential successors proceed.
    pub taken: Option<Vec<NodeId>>,
}

impl NodeResult {
    pub fn value(output: Value) -> Self {
        Self {
            input: Value::Null,
            output: Some(output),
            sets: Object::new(),
            taken: None,
        }
    }

    pub fn route(taken: Vec<NodeId>) -> Self {
        Self {
            input: Value::Null,
            output: None,
            sets: Object::new(),
            taken: Some(taken),
        }
    }
}

/// Execute one node against a context snapshot.
pub(crate) async fn run_node(
    node_id: &str,
    node: &Node,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    env.events.emit(crate::event::ExecutionEvent::NodeStart {
        node_id: node_id.to_string(),
        input: Value::Null,
        at: Utc::now(),
    });

    let result = match &node.kind {
        NodeKind::Exec(n) => exec::run(node_id, n, scope, env).await,
        NodeKind::Mapping(n) => mapping::run(node_id, n, scope).await,
        NodeKind::Condition(n) => condition::run(n, scope).await,
        NodeKind::Switch(n) => switch::run(n, scope).await,
        NodeKind::Delay(n) => delay::run(n, env).await,
        NodeKind::Each(n) => each::run(node_id, n, scope, env).await,
        NodeKind::Loop(n) => r#loop::run(node_id, n, scope, env).await,
        NodeKind::Agent(n) => agent::run(node_id, n, scope, env).await,
        NodeKind::Mcp(n) => mcp::run(node_id, n, scope, env).await,
        NodeKind::Guard(n) => guard::run(node_id, n, scope, env).await,
        NodeKind::Approval(n) => approval::run(node_id, n, env).await,
        NodeKind::Handoff(n) => handoff::run(node_id, n, scope, env).await,
    };

    result.map_err(|e| match e {
        err @ (EngineError::Node { .. } | EngineError::Cancelled) => err,
        other => EngineError::at_node(node_id, other),
    })
}

/// Evaluate an optional `args` block; absent args are `null`.
pub(crate) fn eval_args(args: &Option<String>, scope: &Context) -> EngineResult<Value> {
    match args {
        Some(src) => Ok(evaluator().evaluate(src, scope)?),
        None => Ok(Value::Null),
    }
}

/// Apply the `with` shaping expression. The raw result is visible both as
/// `$raw` and under the node's own ID.
pub(crate) fn apply_with(
    with: &Option<String>,
    raw: Value,
    node_id: &str,
    scope: &Arc<Context>,
) -> EngineResult<Value> {
    match with {
        None => Ok(raw),
        Some(src) => {
            let mut frame = Context::child_of(scope.clone());
            frame.set("$raw", raw.clone());
            frame.set(node_id, raw);
            Ok(evaluator().evaluate(src, &frame)?)
        }
    }
}

/// Evaluate a `sets` block into context writes, with the node's shaped
/// output visible under its ID.
pub(crate) fn eval_sets(
    sets: &Option<String>,
    node_id: &str,
    output: &Value,
    scope: &Arc<Context>,
) -> EngineResult<Object> {
    match sets {
        None => Ok(Object::new()),
        Some(src) => {
            let mut frame = Context::child_of(scope.clone());
            frame.set(node_id, output.clone());
            Ok(evaluator().evaluate_bindings(src, &frame)?)
        }
    }
}
