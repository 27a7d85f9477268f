//! Mapping node: evaluate `with`, bind under the node ID.

use super::{NodeResult, eval_sets, evaluator};
use crate::error::EngineResult;
use crate::flow::MappingNode;
use cascade_gml::{Context, Value};
use std::sync::Arc;

pub(crate) async fn run(
    node_id: &str,
    node: &MappingNode,
    scope: Arc<Context>,
) -> EngineResult<NodeResult> {
    let output = evaluator().evaluate(&node.with, &scope)?;
    let sets = eval_sets(&node.sets, node_id, &output, &scope)?;
    Ok(NodeResult {
        input: Value::Null,
        output: Some(output),
        sets,
        taken: None,
    })
}
