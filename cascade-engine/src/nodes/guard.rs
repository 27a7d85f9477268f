//! Guard node: safety checks over node input.
//!
//! Built-in checks: `custom` (GML-bool, truthy is a violation), `pii`
//! (pattern scan over strings) and `schema` (shallow shape check).
//! `jailbreak`/`moderation`/`hallucination` delegate to a registered
//! `guard://` service when one exists and pass otherwise.
//!
//! Actions: `block` routes to `else` (or fails the node when there is no
//! else branch), `warn` continues with an annotated result, `redact`
//! masks the flagged spans and continues.

use super::{NodeResult, eval_args, evaluator};
use crate::error::{EngineError, EngineResult};
use crate::flow::{GuardAction, GuardNode, GuardType};
use crate::scheduler::ExecEnv;
use cascade_gml::{Context, Object, Value};
use cascade_tools::{InvokeContext, ToolUri};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

static PII_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "email",
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
        ),
        ("phone", Regex::new(r"\+?\d[\d -]{7,14}\d").unwrap()),
        (
            "card",
            Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").unwrap(),
        ),
    ]
});

#[derive(Debug, Clone)]
struct Violation {
    check: &'static str,
    detail: String,
}

pub(crate) async fn run(
    node_id: &str,
    node: &GuardNode,
    scope: Arc<Context>,
    env: &ExecEnv,
) -> EngineResult<NodeResult> {
    let input = eval_args(&node.args, &scope)?;
    let mut violations = Vec::new();

    for guard_type in &node.guard.types {
        match guard_type {
            GuardType::Custom => {
                if let Some(expression) = &node.guard.expression {
                    let mut frame = Context::child_of(scope.clone());
                    frame.set("input", input.clone());
                    if evaluator().evaluate_bool(expression, &frame)? {
                        violations.push(Violation {
                            check: "custom",
                            detail: expression.clone(),
                        });
                    }
                }
            }
            GuardType::Pii => scan_pii(&input, &mut violations),
            GuardType::Schema => {
                if let Some(schema) = &node.guard.schema {
                    check_schema(&input, schema, &mut violations);
                }
            }
            GuardType::Jailbreak | GuardType::Moderation | GuardType::Hallucination => {
                let check = match guard_type {
                    GuardType::Jailbreak => "jailbreak",
                    GuardType::Moderation => "moderation",
                    _ => "hallucination",
                };
                if let Some(violation) = external_check(check, &input, env).await? {
                    violations.push(violation);
                }
            }
        }
    }

    let passed = violations.is_empty();
    let violation_values: Vec<Value> = violations
        .iter()
        .map(|v| {
            Value::object([
                ("check", Value::string(v.check)),
                ("detail", Value::string(v.detail.clone())),
            ])
        })
        .collect();

    let (result_input, action_taken) = match (passed, node.guard.action) {
        (true, _) => (input.clone(), "pass"),
        (false, GuardAction::Warn) => (input.clone(), "warn"),
        (false, GuardAction::Redact) => (redact(&input), "redact"),
        (false, GuardAction::Block) => {
            // Without an else branch a blocking violation fails the node;
            // the scheduler then routes through `fail` if configured.
            if node.r#else.is_none() {
                return Err(EngineError::Validation(format!(
                    "guard blocked: {}",
                    violations
                        .iter()
                        .map(|v| v.check)
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            (input.clone(), "block")
        }
    };

    let output = Value::object([
        ("passed", Value::Bool(passed)),
        ("action", Value::string(action_taken)),
        ("violations", Value::Array(violation_values)),
        ("input", result_input),
    ]);

    // Blocked violations route to `else`; everything else takes `then`.
    let blocked = !passed && node.guard.action == GuardAction::Block;
    let taken = if blocked {
        node.r#else.iter().cloned().collect()
    } else {
        node.then.iter().cloned().collect()
    };

    Ok(NodeResult {
        input,
        output: Some(output),
        sets: Object::new(),
        taken: Some(taken),
    })
}

fn scan_pii(value: &Value, violations: &mut Vec<Violation>) {
    match value {
        Value::String(s) => {
            for (name, pattern) in PII_PATTERNS.iter() {
                if pattern.is_match(s) {
                    violations.push(Violation {
                        check: "pii",
                        detail: format!("{} detected", name),
                    });
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_pii(item, violations);
            }
        }
        Value::Object(obj) => {
            for item in obj.values() {
                scan_pii(item, violations);
            }
        }
        _ => {}
    }
}

/// Mask every PII match in string values.
fn redact(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let mut out = s.clone();
            for (_, pattern) in PII_PATTERNS.iter() {
                out = pattern.replace_all(&out, "***").into_owned();
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter().map(|(k, v)| (k.clone(), redact(v))).collect(),
        ),
        other => other.clone(),
    }
}

/// Shallow schema check: `required` field names plus `properties.<f>.type`
/// kind names (`string`, `number`, `boolean`, `array`, `object`).
fn check_schema(input: &Value, schema: &serde_json::Value, violations: &mut Vec<Violation>) {
    let Some(obj) = input.as_object() else {
        violations.push(Violation {
            check: "schema",
            detail: "input is not an object".to_string(),
        });
        return;
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !obj.contains_key(field) {
                violations.push(Violation {
                    check: "schema",
                    detail: format!("missing required field '{}'", field),
                });
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, prop) in properties {
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let Some(actual) = obj.get(field) else {
                continue;
            };
            let matches = match expected {
                "string" => actual.as_str().is_some(),
                "number" => actual.as_float().is_some(),
                "boolean" => actual.as_bool().is_some(),
                "array" => actual.as_array().is_some(),
                "object" => actual.as_object().is_some(),
                _ => true,
            };
            if !matches {
                violations.push(Violation {
                    check: "schema",
                    detail: format!(
                        "field '{}' expected {}, got {}",
                        field,
                        expected,
                        actual.type_name()
                    ),
                });
            }
        }
    }
}

/// Model-based checks go through a `guard://` service when registered;
/// without one the check passes.
async fn external_check(
    check: &'static str,
    input: &Value,
    env: &ExecEnv,
) -> EngineResult<Option<Violation>> {
    if !env.tools.has_scheme("guard") {
        tracing::debug!(check, "no guard service registered; check passes");
        return Ok(None);
    }

    let uri = ToolUri::parse(&format!("guard://{}/check", check))?;
    let ictx = InvokeContext::new(env.tenant.tenant_id.clone(), Duration::from_secs(30))
        .with_cancel(env.cancel.child_token());
    let output = env
        .tools
        .invoke(&env.tenant.tenant_id, &uri, input.to_json(), ictx)
        .await?;

    let flagged = output
        .value
        .get("flagged")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if flagged {
        let detail = output
            .value
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("flagged by guard service")
            .to_string();
        Ok(Some(Violation { check, detail }))
    } else {
        Ok(None)
    }
}
