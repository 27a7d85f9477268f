//! Handoff node: delegate to another agent with a projected context.

use super::{NodeResult, apply_with, eval_args};
use crate::error::{EngineError, EngineResult};
use crate::flow::{HandoffNode, ResumeOn};
use crate::scheduler::ExecEnv;
use cascade_gml::{Context, Object, Value};
use cascade_tools::{InvokeContext, ToolError, ToolUri};
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn run(
    node_id: &str,
    node: &HandoffNode,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let args = eval_args(&node.args, &scope)?;

    // Only the listed context keys travel with the handoff.
    let projected: Object = node
        .handoff
        .context
        .iter()
        .map(|key| {
            (
                key.clone(),
                scope.get(key).cloned().unwrap_or(Value::Null),
            )
        })
        .collect();

    let payload = serde_json::json!({
        "model": node.handoff.target,
        "system": serde_json::Value::Null,
        "messages": [serde_json::json!({
            "handoff": true,
            "context": Value::Object(projected).to_json(),
            "args": args.to_json(),
        })],
    });

    let uri = ToolUri::parse(&format!("agent://{}/handoff", node.handoff.target))?;
    let resolved = env
        .tools
        .resolve(&env.tenant.tenant_id, "agent", &node.handoff.target)?;
    let spec = resolved.config.tool_spec(&uri);
    let ictx = InvokeContext::new(
        env.tenant.tenant_id.clone(),
        Duration::from_millis(spec.timeout_ms),
    )
    .with_cancel(env.cancel.child_token());

    let invocation = env
        .tools
        .invoke(&env.tenant.tenant_id, &uri, payload, ictx)
        .await;

    // `resume_on` decides which target outcomes this node waits out.
    let raw = match (node.handoff.resume_on, invocation) {
        (_, Err(ToolError::Cancelled)) => return Err(EngineError::Cancelled),
        (ResumeOn::Completed, Ok(output)) => Value::from_json(&output.value),
        (ResumeOn::Completed, Err(e)) => return Err(e.into()),
        (ResumeOn::Error, Ok(_)) => Value::Null,
        (ResumeOn::Error, Err(e)) => Value::object([("error", Value::string(e.to_string()))]),
        (ResumeOn::Any, Ok(output)) => Value::from_json(&output.value),
        (ResumeOn::Any, Err(e)) => Value::object([("error", Value::string(e.to_string()))]),
    };

    let shaped = apply_with(&node.with, raw, node_id, &scope)?;
    Ok(NodeResult {
        input: args,
        output: Some(shaped),
        sets: Object::new(),
        taken: None,
    })
}
