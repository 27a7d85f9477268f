//! Switch node: first truthy case wins, declaration order.

use super::{NodeResult, evaluator};
use crate::error::EngineResult;
use crate::flow::SwitchNode;
use cascade_gml::Context;
use std::sync::Arc;

pub(crate) async fn run(node: &SwitchNode, scope: Arc<Context>) -> EngineResult<NodeResult> {
    for case in &node.cases {
        if evaluator().evaluate_bool(&case.when, &scope)? {
            return Ok(NodeResult::route(vec![case.then.clone()]));
        }
    }
    Ok(NodeResult::route(node.r#else.iter().cloned().collect()))
}
