//! Flow model: the typed, immutable representation of a flow definition.
//!
//! Nodes are a tagged variant; executors dispatch on the tag. Sub-flow
//! bodies (`Each`/`Loop`) form their own node-ID namespace.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use cascade_gml::Value;

pub type NodeId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub meta: FlowMeta,
    #[serde(default)]
    pub args: FlowArgs,
    /// GML block producing the initial context variables.
    #[serde(default)]
    pub vars: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerDef>,
    pub nodes: IndexMap<NodeId, Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMeta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerDef {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowArgs {
    #[serde(default)]
    pub inputs: Vec<InputParam>,
    #[serde(default)]
    pub output: Option<OutputDef>,
    #[serde(default)]
    pub defs: IndexMap<String, TypeDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    pub ty: TypeSpec,
    /// Default value as a GML expression source.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputDef {
    /// `out: <type>` - the implicit single result.
    Single(TypeSpec),
    /// Named output parameters projected from the final context.
    Params(Vec<InputParam>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub fields: IndexMap<String, TypeSpec>,
}

/// Parsed type expression: base type plus `map<>` / `[]` / `?` suffixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSpec {
    pub kind: TypeKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeKind {
    Bool,
    Int,
    Long,
    Double,
    Decimal,
    String,
    Date,
    Any,
    Custom(String),
    Array(Box<TypeSpec>),
    Map(Box<TypeSpec>),
}

impl TypeSpec {
    /// Parse the type grammar. Suffix parse order: `map<T>`, then `[]`,
    /// then `?`; `?[]` is invalid.
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut s = source.trim();
        if s.is_empty() {
            return Err("empty type".to_string());
        }

        let nullable = if let Some(stripped) = s.strip_suffix('?') {
            s = stripped.trim_end();
            true
        } else {
            false
        };

        if s.ends_with("[]") {
            let inner = TypeSpec::parse(&s[..s.len() - 2])?;
            if inner.nullable {
                return Err(format!("'?[]' is invalid in '{}'", source));
            }
            return Ok(TypeSpec {
                kind: TypeKind::Array(Box::new(inner)),
                nullable,
            });
        }

        if let Some(rest) = s.strip_prefix("map<") {
            let Some(inner_src) = rest.strip_suffix('>') else {
                return Err(format!("unterminated map type in '{}'", source));
            };
            let inner = TypeSpec::parse(inner_src)?;
            return Ok(TypeSpec {
                kind: TypeKind::Map(Box::new(inner)),
                nullable,
            });
        }

        if s.contains('?') {
            return Err(format!("misplaced '?' in '{}'", source));
        }

        let kind = match s {
            "bool" => TypeKind::Bool,
            "int" => TypeKind::Int,
            "long" => TypeKind::Long,
            "double" => TypeKind::Double,
            "decimal" => TypeKind::Decimal,
            "string" => TypeKind::String,
            "date" => TypeKind::Date,
            "any" => TypeKind::Any,
            custom if custom.chars().all(|c| c.is_alphanumeric() || c == '_') => {
                TypeKind::Custom(custom.to_string())
            }
            other => return Err(format!("invalid type '{}'", other)),
        };
        Ok(TypeSpec { kind, nullable })
    }

    /// Shallow kind check of a runtime value against this type.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return self.nullable;
        }
        match &self.kind {
            TypeKind::Any | TypeKind::Custom(_) => true,
            TypeKind::Bool => matches!(value, Value::Bool(_)),
            TypeKind::Int | TypeKind::Long => matches!(value, Value::Int(_)),
            TypeKind::Double | TypeKind::Decimal => {
                matches!(value, Value::Int(_) | Value::Float(_))
            }
            TypeKind::String | TypeKind::Date => matches!(value, Value::String(_)),
            TypeKind::Array(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.accepts(item))),
            TypeKind::Map(inner) => value
                .as_object()
                .is_some_and(|obj| obj.values().all(|item| inner.accepts(item))),
        }
    }
}

/// Fields shared by every node variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeBase {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// GML boolean; falsy skips the node and satisfies its successors.
    #[serde(default)]
    pub only: Option<String>,
    #[serde(default)]
    pub next: Vec<NodeId>,
    /// Failure handler target, traversed only when the node fails.
    #[serde(default)]
    pub fail: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub base: NodeBase,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Exec(ExecNode),
    Mapping(MappingNode),
    Condition(ConditionNode),
    Switch(SwitchNode),
    Delay(DelayNode),
    Each(EachNode),
    Loop(LoopNode),
    Agent(AgentNode),
    Mcp(McpNode),
    Guard(GuardNode),
    Approval(ApprovalNode),
    Handoff(HandoffNode),
}

impl NodeKind {
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Exec(_) => "exec",
            NodeKind::Mapping(_) => "mapping",
            NodeKind::Condition(_) => "condition",
            NodeKind::Switch(_) => "switch",
            NodeKind::Delay(_) => "delay",
            NodeKind::Each(_) => "each",
            NodeKind::Loop(_) => "loop",
            NodeKind::Agent(_) => "agent",
            NodeKind::Mcp(_) => "mcp",
            NodeKind::Guard(_) => "guard",
            NodeKind::Approval(_) => "approval",
            NodeKind::Handoff(_) => "handoff",
        }
    }

    /// Branch targets whose edges are conditional on this node's outcome.
    pub fn branch_targets(&self) -> Vec<&NodeId> {
        match self {
            NodeKind::Condition(n) => {
                let mut targets = vec![&n.then];
                targets.extend(n.r#else.iter());
                targets
            }
            NodeKind::Switch(n) => {
                let mut targets: Vec<&NodeId> = n.cases.iter().map(|c| &c.then).collect();
                targets.extend(n.r#else.iter());
                targets
            }
            NodeKind::Guard(n) => n.then.iter().chain(n.r#else.iter()).collect(),
            NodeKind::Approval(n) => n.then.iter().chain(n.r#else.iter()).collect(),
            _ => Vec::new(),
        }
    }

    /// Sub-flow body for Each/Loop nodes.
    pub fn body(&self) -> Option<&IndexMap<NodeId, Node>> {
        match self {
            NodeKind::Each(n) => Some(&n.body),
            NodeKind::Loop(n) => Some(&n.body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecNode {
    /// Tool URI: `<type>://<service>/<path>?<opts>`.
    pub exec: String,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub with: Option<String>,
    #[serde(default)]
    pub sets: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingNode {
    pub with: String,
    #[serde(default)]
    pub sets: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub when: String,
    pub then: NodeId,
    #[serde(default)]
    pub r#else: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchNode {
    pub cases: Vec<CaseArm>,
    #[serde(default)]
    pub r#else: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArm {
    pub when: String,
    pub then: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayNode {
    /// `"5s"`, `"2m"`, `"1h"` or bare milliseconds.
    pub wait: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EachNode {
    /// `"sourceExpr => itemAlias[, indexAlias]"`.
    pub each: String,
    #[serde(default)]
    pub vars: Option<String>,
    pub body: IndexMap<NodeId, Node>,
    #[serde(default)]
    pub with: Option<String>,
    #[serde(default)]
    pub mode: IterationMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNode {
    /// GML bindings seeding the loop state.
    pub vars: String,
    /// Continue condition, re-evaluated before every iteration.
    pub when: String,
    pub body: IndexMap<NodeId, Node>,
    #[serde(default)]
    pub with: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub agent: AgentSpec,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub with: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Markdown,
    #[default]
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpNode {
    pub mcp: McpSpec,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub with: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpSpec {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardNode {
    pub guard: GuardSpec,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub then: Option<NodeId>,
    #[serde(default)]
    pub r#else: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSpec {
    pub types: Vec<GuardType>,
    pub action: GuardAction,
    /// Shape requirements for the `schema` check.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
    /// GML boolean for the `custom` check; truthy means violation.
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardType {
    Pii,
    Jailbreak,
    Moderation,
    Hallucination,
    Schema,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardAction {
    Block,
    Warn,
    Redact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalNode {
    pub approval: ApprovalSpec,
    #[serde(default)]
    pub then: Option<NodeId>,
    #[serde(default)]
    pub r#else: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<ApprovalOption>,
    /// Same duration grammar as Delay `wait`.
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub timeout_action: Option<TimeoutAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalOption {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Whether choosing this option routes to `then`. When no option in
    /// the list is marked, the first one approves.
    #[serde(default)]
    pub approve: Option<bool>,
}

impl ApprovalSpec {
    /// Whether the chosen option routes through `then`.
    pub fn approves(&self, option_id: &str) -> bool {
        let explicit = self.options.iter().any(|o| o.approve.is_some());
        if explicit {
            self.options
                .iter()
                .find(|o| o.id == option_id)
                .and_then(|o| o.approve)
                .unwrap_or(false)
        } else {
            self.options.first().is_some_and(|o| o.id == option_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffNode {
    pub handoff: HandoffSpec,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub with: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffSpec {
    pub target: String,
    /// Context keys projected into the handoff payload.
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub resume_on: ResumeOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeOn {
    #[default]
    Completed,
    Error,
    Any,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parsing() {
        let t = TypeSpec::parse("int").unwrap();
        assert_eq!(t.kind, TypeKind::Int);
        assert!(!t.nullable);

        let t = TypeSpec::parse("string?").unwrap();
        assert!(t.nullable);

        let t = TypeSpec::parse("int[]?").unwrap();
        assert!(t.nullable);
        let TypeKind::Array(inner) = &t.kind else {
            panic!("expected array");
        };
        assert_eq!(inner.kind, TypeKind::Int);
        assert!(!inner.nullable);

        let t = TypeSpec::parse("map<string>").unwrap();
        assert!(matches!(t.kind, TypeKind::Map(_)));

        let t = TypeSpec::parse("Customer").unwrap();
        assert_eq!(t.kind, TypeKind::Custom("Customer".to_string()));
    }

    #[test]
    fn test_invalid_types_rejected() {
        assert!(TypeSpec::parse("int?[]").is_err());
        assert!(TypeSpec::parse("map<int").is_err());
        assert!(TypeSpec::parse("").is_err());
        assert!(TypeSpec::parse("foo bar").is_err());
    }

    #[test]
    fn test_type_accepts() {
        let int_arr = TypeSpec::parse("int[]").unwrap();
        assert!(int_arr.accepts(&Value::array([Value::Int(1), Value::Int(2)])));
        assert!(!int_arr.accepts(&Value::array([Value::string("x")])));
        assert!(!int_arr.accepts(&Value::Null));
        assert!(TypeSpec::parse("int[]?").unwrap().accepts(&Value::Null));

        let any = TypeSpec::parse("any").unwrap();
        assert!(any.accepts(&Value::Bool(true)));

        let double = TypeSpec::parse("double").unwrap();
        assert!(double.accepts(&Value::Int(3)));
        assert!(double.accepts(&Value::Float(3.5)));
    }

    #[test]
    fn test_approval_approve_set() {
        let spec = ApprovalSpec {
            title: "deploy".to_string(),
            description: None,
            options: vec![
                ApprovalOption {
                    id: "ok".to_string(),
                    label: None,
                    approve: None,
                },
                ApprovalOption {
                    id: "no".to_string(),
                    label: None,
                    approve: None,
                },
            ],
            timeout: None,
            timeout_action: None,
        };
        // No explicit marks: first option approves.
        assert!(spec.approves("ok"));
        assert!(!spec.approves("no"));

        let mut explicit = spec.clone();
        explicit.options[1].approve = Some(true);
        assert!(!explicit.approves("ok"));
        assert!(explicit.approves("no"));
    }

    #[test]
    fn test_branch_targets() {
        let kind = NodeKind::Condition(ConditionNode {
            when: "x > 0".to_string(),
            then: "a".to_string(),
            r#else: Some("b".to_string()),
        });
        let targets: Vec<&String> = kind.branch_targets();
        assert_eq!(targets, [&"a".to_string(), &"b".to_string()]);
    }
}
