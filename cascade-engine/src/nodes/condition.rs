//! Condition node: route to `then` or `else`; the untaken branch's
//! downstream is skip-propagated by the scheduler.

use super::{NodeResult, evaluator};
use crate::error::EngineResult;
use crate::flow::ConditionNode;
use cascade_gml::Context;
use std::sync::Arc;

pub(crate) async fn run(node: &ConditionNode, scope: Arc<Context>) -> EngineResult<NodeResult> {
    let truthy = evaluator().evaluate_bool(&node.when, &scope)?;
    let taken = if truthy {
        vec![node.then.clone()]
    } else {
        node.r#else.iter().cloned().collect()
    };
    Ok(NodeResult::route(taken))
}
