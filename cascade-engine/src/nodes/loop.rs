//! Loop node: seed state with `vars`, run the body while `when` holds.
//!
//! Body outputs and `sets` writes land in the loop frame so the condition
//! observes updated state; they do not leak to the parent. A configurable
//! iteration bound guards against non-terminating conditions.

use super::{NodeResult, evaluator};
use crate::error::{EngineError, EngineResult, SchedulingError};
use crate::flow::LoopNode;
use crate::scheduler::{ExecEnv, GraphRunner, RunStatus};
use cascade_gml::{Context, Value};
use std::sync::Arc;

pub(crate) fn run<'a>(
    node_id: &'a str,
    node: &'a LoopNode,
    scope: Arc<Context>,
    env: &'a ExecEnv,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<NodeResult>> + Send + 'a>> {
    Box::pin(async move {
        let mut loop_ctx = Context::child_of(scope);
        let seed = evaluator().evaluate_bindings(&node.vars, &loop_ctx)?;
        loop_ctx.extend(seed);

        let bound = env.options.loop_max_iterations;
        let mut iterations = 0u32;

        while evaluator().evaluate_bool(&node.when, &loop_ctx)? {
            iterations += 1;
            if iterations > bound {
                return Err(SchedulingError::LoopBoundExceeded {
                    node_id: node_id.to_string(),
                    bound,
                }
                .into());
            }
            if env.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let runner = GraphRunner::new(node.body.clone(), env.deeper()?, false)?;
            let outcome = Box::pin(runner.run(&mut loop_ctx)).await?;
            match outcome.status {
                RunStatus::Completed => {}
                RunStatus::Failed { node_id: failed, error } => {
                    return Err(EngineError::State(format!(
                        "loop iteration {} failed at '{}': {}",
                        iterations, failed, error
                    )));
                }
                RunStatus::Cancelled => return Err(EngineError::Cancelled),
            }
        }

        let output = match &node.with {
            Some(with) => evaluator().evaluate(with, &loop_ctx)?,
            None => Value::Object(loop_ctx.variables().clone()),
        };
        Ok(NodeResult::value(output))
    })
}
