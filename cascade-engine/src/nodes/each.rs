//! Each node: iterate a source collection through a sub-flow.
//!
//! Arrays iterate values; objects iterate `{key, value}` pairs in
//! insertion order. Each iteration runs the body in its own child frame;
//! writes stay confined to that frame, so parallel iterations cannot race
//! on shared state. Results are collected in iteration order regardless of
//! completion order.

use super::{NodeResult, evaluator};
use crate::error::{EngineError, EngineResult};
use crate::event::ExecutionEvent;
use crate::flow::{EachNode, IterationMode};
use crate::scheduler::{ExecEnv, GraphRunner, RunOutcome, RunStatus};
use cascade_gml::{Context, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub(crate) async fn run(
    node_id: &str,
    node: &EachNode,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let (source_expr, item_alias, index_alias) = parse_each(&node.each)?;

    let source = evaluator().evaluate(&source_expr, &scope)?;
    let items: Vec<Value> = match source {
        Value::Array(items) => items,
        Value::Object(entries) => entries
            .into_iter()
            .map(|(key, value)| {
                Value::object([("key", Value::string(key)), ("value", value)])
            })
            .collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(EngineError::Validation(format!(
                "each source '{}' is not iterable (got {})",
                source_expr,
                other.type_name()
            )));
        }
    };

    // Optional seed variables, evaluated once and shared read-only by all
    // iterations through the base frame.
    let mut base = Context::child_of(scope.clone());
    if let Some(vars) = &node.vars {
        let bindings = evaluator().evaluate_bindings(vars, &base)?;
        base.extend(bindings);
    }
    let base = Arc::new(base);

    let results = match node.mode {
        IterationMode::Sequential => {
            run_sequential(node_id, node, &items, &item_alias, index_alias.as_deref(), &base, env)
                .await?
        }
        IterationMode::Parallel => {
            run_parallel(node_id, node, items, &item_alias, index_alias.as_deref(), &base, env)
                .await?
        }
    };

    Ok(NodeResult::value(Value::Array(results)))
}

#[allow(clippy::too_many_arguments)]
async fn run_sequential(
    node_id: &str,
    node: &EachNode,
    items: &[Value],
    item_alias: &str,
    index_alias: Option<&str>,
    base: &Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<Vec<Value>> {
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if env.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        env.events.emit(ExecutionEvent::IterationStart {
            node_id: node_id.to_string(),
            index,
        });
        let value = run_iteration(
            node,
            item.clone(),
            index,
            item_alias,
            index_alias,
            base.clone(),
            env.deeper()?,
        )
        .await?;
        env.events.emit(ExecutionEvent::IterationEnd {
            node_id: node_id.to_string(),
            index,
        });
        results.push(value);
    }
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
async fn run_parallel(
    node_id: &str,
    node: &EachNode,
    items: Vec<Value>,
    item_alias: &str,
    index_alias: Option<&str>,
    base: &Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<Vec<Value>> {
    let permits = Arc::new(Semaphore::new(env.options.max_parallel.max(1)));
    let mut joinset: JoinSet<(usize, EngineResult<Value>)> = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let node = node.clone();
        let item_alias = item_alias.to_string();
        let index_alias = index_alias.map(str::to_string);
        let base = base.clone();
        let child_env = env.deeper()?;
        let permits = permits.clone();
        let events = env.events.clone();
        let node_id = node_id.to_string();

        joinset.spawn(async move {
            // The semaphore is never closed; a failed acquire just means
            // the iteration runs unthrottled.
            let _permit = permits.acquire_owned().await.ok();
            events.emit(ExecutionEvent::IterationStart {
                node_id: node_id.clone(),
                index,
            });
            let result = run_iteration(
                &node,
                item,
                index,
                &item_alias,
                index_alias.as_deref(),
                base,
                child_env,
            )
            .await;
            events.emit(ExecutionEvent::IterationEnd { node_id, index });
            (index, result)
        });
    }

    let mut results: Vec<Option<Value>> = Vec::new();
    while let Some(joined) = joinset.join_next().await {
        let (index, result) = joined
            .map_err(|e| EngineError::State(format!("iteration task failed: {}", e)))?;
        let value = result?;
        if results.len() <= index {
            results.resize(index + 1, None);
        }
        results[index] = Some(value);
    }
    Ok(results.into_iter().map(|v| v.unwrap_or(Value::Null)).collect())
}

fn run_iteration<'a>(
    node: &'a EachNode,
    item: Value,
    index: usize,
    item_alias: &'a str,
    index_alias: Option<&'a str>,
    base: Arc<Context>,
    env: ExecEnv,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<Value>> + Send + 'a>> {
    Box::pin(async move {
        let mut frame = Context::child_of(base);
        frame.set(item_alias, item);
        if let Some(idx) = index_alias {
            frame.set(idx, Value::Int(index as i64));
        }

        let runner = GraphRunner::new(node.body.clone(), env, false)?;
        let outcome = Box::pin(runner.run(&mut frame)).await?;
        if let RunStatus::Failed { node_id, error } = &outcome.status {
            return Err(EngineError::State(format!(
                "iteration {} failed at '{}': {}",
                index, node_id, error
            )));
        }
        if matches!(outcome.status, RunStatus::Cancelled) {
            return Err(EngineError::Cancelled);
        }

        iteration_value(node, &outcome, &frame)
    })
}

/// The per-iteration result: `with` evaluated against the iteration's
/// final frame, or the sub-flow's terminal node output(s).
fn iteration_value(node: &EachNode, outcome: &RunOutcome, frame: &Context) -> EngineResult<Value> {
    if let Some(with) = &node.with {
        return Ok(evaluator().evaluate(with, frame)?);
    }
    let mut leaves = outcome.leaf_outputs.clone();
    match leaves.len() {
        0 => Ok(Value::Null),
        1 => Ok(leaves.shift_remove_index(0).unwrap().1),
        _ => Ok(Value::Object(leaves)),
    }
}

/// Parse `"sourceExpr => itemAlias[, indexAlias]"`. The split is on the
/// last `=>` so the source may itself contain lambdas.
pub(crate) fn parse_each(expr: &str) -> EngineResult<(String, String, Option<String>)> {
    let (source, aliases) = expr.rsplit_once("=>").ok_or_else(|| {
        EngineError::Validation(format!("invalid each expression: '{}'", expr))
    })?;
    let source = source.trim();
    if source.is_empty() {
        return Err(EngineError::Validation(format!(
            "each expression '{}' has no source",
            expr
        )));
    }

    let mut names = aliases.split(',').map(str::trim);
    let item = names.next().filter(|s| !s.is_empty()).ok_or_else(|| {
        EngineError::Validation(format!("each expression '{}' has no item alias", expr))
    })?;
    let index = names.next().filter(|s| !s.is_empty()).map(str::to_string);

    Ok((source.to_string(), item.to_string(), index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each() {
        let (source, item, index) = parse_each("items => it, idx").unwrap();
        assert_eq!(source, "items");
        assert_eq!(item, "it");
        assert_eq!(index.as_deref(), Some("idx"));

        let (source, item, index) = parse_each("orders.filter(o => o.open) => o").unwrap();
        assert_eq!(source, "orders.filter(o => o.open)");
        assert_eq!(item, "o");
        assert_eq!(index, None);
    }

    #[test]
    fn test_parse_each_rejects_malformed() {
        assert!(parse_each("items").is_err());
        assert!(parse_each(" => it").is_err());
        assert!(parse_each("items => ").is_err());
    }
}
