//! Mcp node: call a tool on a configured MCP server.

use super::{NodeResult, apply_with, eval_args};
use crate::error::EngineResult;
use crate::flow::McpNode;
use crate::scheduler::ExecEnv;
use cascade_gml::{Context, Value};
use cascade_tools::{InvokeContext, ToolUri};
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn run(
    node_id: &str,
    node: &McpNode,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let args = eval_args(&node.args, &scope)?;

    let uri = ToolUri::parse(&format!(
        "mcp://{}/{}",
        node.mcp.server, node.mcp.tool
    ))?;
    let resolved = env
        .tools
        .resolve(&env.tenant.tenant_id, "mcp", &node.mcp.server)?;
    let spec = resolved.config.tool_spec(&uri);

    let mut ictx = InvokeContext::new(
        env.tenant.tenant_id.clone(),
        Duration::from_millis(spec.timeout_ms),
    )
    .with_cancel(env.cancel.child_token());
    if let Some(auth) = &node.mcp.auth {
        ictx.metadata.insert("auth".to_string(), auth.clone());
    }

    let output = env
        .tools
        .invoke(&env.tenant.tenant_id, &uri, args.to_json(), ictx)
        .await?;

    let raw = Value::from_json(&output.value);
    let shaped = apply_with(&node.with, raw, node_id, &scope)?;
    Ok(NodeResult {
        input: args,
        output: Some(shaped),
        sets: cascade_gml::Object::new(),
        taken: None,
    })
}
