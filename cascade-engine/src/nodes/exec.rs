//! Exec node: invoke an external tool through the registry.
//!
//! Parses the tool URI, evaluates `args`, resolves the handler by
//! `(tenant, scheme, service)`, and invokes it with a deadline derived
//! from the tool spec. Retries happen here, inside the executor; the
//! scheduler only ever sees the post-retry outcome. `flow://` URIs recurse
//! into a nested flow execution instead of a handler.

use super::{NodeResult, apply_with, eval_args, eval_sets, evaluator};
use crate::error::{EngineError, EngineResult};
use crate::scheduler::{ExecEnv, GraphRunner};
use cascade_gml::{Context, Value};
use cascade_tools::{InvokeContext, ToolError, ToolUri};
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn run(
    node_id: &str,
    node: &crate::flow::ExecNode,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let uri = ToolUri::parse(&node.exec)?;
    let args = eval_args(&node.args, &scope)?;

    let raw = if uri.scheme == "flow" {
        run_nested_flow(&uri, &args, env).await?
    } else {
        invoke_with_retries(&uri, &args, env).await?
    };

    let output = apply_with(&node.with, raw, node_id, &scope)?;
    let sets = eval_sets(&node.sets, node_id, &output, &scope)?;

    Ok(NodeResult {
        input: args,
        output: Some(output),
        sets,
        taken: None,
    })
}

async fn invoke_with_retries(uri: &ToolUri, args: &Value, env: &ExecEnv) -> EngineResult<Value> {
    let resolved = env
        .tools
        .resolve(&env.tenant.tenant_id, &uri.scheme, &uri.service)?;
    let spec = resolved.config.tool_spec(uri);
    let json_args = args.to_json();

    let mut attempt = 0u32;
    loop {
        let mut ictx = InvokeContext::new(
            env.tenant.tenant_id.clone(),
            Duration::from_millis(spec.timeout_ms),
        )
        .with_cancel(env.cancel.child_token());
        ictx.metadata = env.tenant.metadata.clone();

        match env
            .tools
            .invoke(&env.tenant.tenant_id, uri, json_args.clone(), ictx)
            .await
        {
            Ok(output) => {
                tracing::debug!(
                    uri = %format!("{}://{}/{}", uri.scheme, uri.service, uri.path),
                    duration_ms = output.duration_ms,
                    attempt,
                    "tool invocation succeeded"
                );
                return Ok(Value::from_json(&output.value));
            }
            Err(ToolError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) if e.retriable() && attempt < spec.max_retries => {
                attempt += 1;
                tracing::warn!(
                    service = %uri.service,
                    attempt,
                    error = %e,
                    "retrying tool invocation"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(spec.backoff_ms)) => {}
                    _ = env.cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// `flow://<flowId>` - nested flow invocation: a fresh execution of the
/// referenced flow with the args as its inputs, sharing this execution's
/// event stream and cancellation token.
fn run_nested_flow<'a>(
    uri: &'a ToolUri,
    args: &'a Value,
    env: &'a ExecEnv,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<Value>> + Send + 'a>> {
    Box::pin(async move {
        let resolver = env.flows.as_ref().ok_or_else(|| {
            EngineError::Validation("flow:// requires a flow resolver".to_string())
        })?;
        let flow = resolver.resolve(&uri.service).ok_or_else(|| {
            EngineError::Validation(format!("flow '{}' not found", uri.service))
        })?;

        let mut root = Context::new();
        if let Value::Object(inputs) = args {
            root.extend(inputs.clone());
        }
        root.set("tenantId", Value::string(env.tenant.tenant_id.clone()));
        if let Some(vars) = &flow.vars {
            let bindings = evaluator().evaluate_bindings(vars, &root)?;
            root.extend(bindings);
        }

        let child_env = env.deeper()?;
        let runner = GraphRunner::new(flow.nodes.clone(), child_env, false)?;
        let outcome = Box::pin(runner.run(&mut root)).await?;
        outcome.to_result(&flow, &root)
    })
}
