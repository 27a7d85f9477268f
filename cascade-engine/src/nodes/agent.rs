//! Agent node: compose a model request and delegate to the agent runtime.

use super::{NodeResult, apply_with, eval_args};
use crate::error::{EngineError, EngineResult};
use crate::flow::{AgentNode, OutputFormat};
use crate::scheduler::ExecEnv;
use cascade_gml::{Context, Value};
use cascade_tools::{InvokeContext, ToolUri};
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn run(
    node_id: &str,
    node: &AgentNode,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let args = eval_args(&node.args, &scope)?;

    // Args become the message list: an array is taken verbatim, an object
    // with `messages` contributes that list, anything else is one message.
    let messages = match &args {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => match obj.get("messages") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![args.clone()],
        },
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };

    let request = serde_json::json!({
        "model": node.agent.model,
        "system": node.agent.instructions,
        "messages": messages.iter().map(Value::to_json).collect::<Vec<_>>(),
        "tools": node.agent.tools,
        "temperature": node.agent.temperature,
    });

    let uri = ToolUri::parse(&format!("agent://{}/complete", node.agent.model))?;
    let resolved = env
        .tools
        .resolve(&env.tenant.tenant_id, "agent", &node.agent.model)?;
    let spec = resolved.config.tool_spec(&uri);

    let ictx = InvokeContext::new(
        env.tenant.tenant_id.clone(),
        Duration::from_millis(spec.timeout_ms),
    )
    .with_cancel(env.cancel.child_token());

    let output = env
        .tools
        .invoke(&env.tenant.tenant_id, &uri, request, ictx)
        .await?;

    let content = output
        .value
        .get("content")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    let raw = parse_response(&content, node.agent.output_format)
        .map_err(|e| EngineError::at_node(node_id, e))?;

    let shaped = apply_with(&node.with, raw, node_id, &scope)?;
    Ok(NodeResult {
        input: args,
        output: Some(shaped),
        sets: cascade_gml::Object::new(),
        taken: None,
    })
}

/// `json` parses the model output into a value; `markdown`/`text` keep the
/// raw string.
fn parse_response(content: &str, format: OutputFormat) -> EngineResult<Value> {
    match format {
        OutputFormat::Json => {
            let json: serde_json::Value = serde_json::from_str(content.trim()).map_err(|e| {
                EngineError::Validation(format!("agent returned invalid JSON: {}", e))
            })?;
            Ok(Value::from_json(&json))
        }
        OutputFormat::Markdown | OutputFormat::Text => Ok(Value::string(content)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_formats() {
        let parsed = parse_response(r#"{"score": 5}"#, OutputFormat::Json).unwrap();
        assert_eq!(parsed.get("score"), Some(&Value::Int(5)));

        let text = parse_response("plain answer", OutputFormat::Text).unwrap();
        assert_eq!(text, Value::string("plain answer"));

        assert!(parse_response("not json", OutputFormat::Json).is_err());
    }
}
