//! FDL parser: YAML flow definitions to the typed [`Flow`] model.
//!
//! The raw document is deserialized permissively (every node field
//! optional), then each node is classified by discriminator priority:
//! `agent, guard, approval, mcp, handoff, exec, wait, each, loop, switch,
//! condition, mapping`. Classification and reference errors are collected
//! best-effort; only a malformed YAML document aborts early.

use crate::error::ParseError;
use crate::flow::*;
use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct FdlDocument {
    flow: FdlFlow,
}

#[derive(Debug, Deserialize)]
struct FdlFlow {
    name: String,
    #[serde(default)]
    desp: Option<String>,
    #[serde(default)]
    mcp_servers: Vec<McpServerDef>,
    #[serde(default)]
    args: Option<FdlArgs>,
    #[serde(default)]
    vars: Option<String>,
    #[serde(default)]
    node: IndexMap<String, FdlNode>,
}

#[derive(Debug, Default, Deserialize)]
struct FdlArgs {
    #[serde(rename = "in", default)]
    inputs: IndexMap<String, FdlParam>,
    #[serde(default)]
    out: Option<FdlOut>,
    #[serde(default)]
    defs: IndexMap<String, IndexMap<String, String>>,
}

/// `name: "type[?][[]] [= default] [# description]"` or the expanded map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FdlParam {
    Spec(String),
    Detailed {
        r#type: String,
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        desp: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FdlOut {
    Single(String),
    Params(IndexMap<String, String>),
}

#[derive(Debug, Default, Deserialize)]
struct FdlNode {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    desp: Option<String>,
    #[serde(default)]
    only: Option<String>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    fail: Option<String>,

    #[serde(default)]
    exec: Option<String>,
    #[serde(default)]
    args: Option<String>,
    #[serde(rename = "with", default)]
    with_expr: Option<String>,
    #[serde(default)]
    sets: Option<String>,

    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    then: Option<String>,
    #[serde(rename = "else", default)]
    else_branch: Option<String>,

    #[serde(default)]
    case: Option<Vec<CaseArm>>,

    /// Duration string or bare milliseconds number.
    #[serde(default)]
    wait: Option<serde_yaml::Value>,

    #[serde(default)]
    each: Option<String>,
    #[serde(default)]
    vars: Option<String>,
    #[serde(default)]
    node: Option<IndexMap<String, FdlNode>>,
    #[serde(default)]
    mode: Option<IterationMode>,

    #[serde(default)]
    agent: Option<AgentSpec>,
    #[serde(default)]
    mcp: Option<McpSpec>,
    #[serde(default)]
    guard: Option<GuardSpec>,
    #[serde(default)]
    approval: Option<ApprovalSpec>,
    #[serde(default)]
    handoff: Option<HandoffSpec>,
}

/// Parse an FDL YAML document into a [`Flow`], collecting all errors.
pub fn parse_flow(yaml: &str) -> Result<Flow, Vec<ParseError>> {
    let doc: FdlDocument = serde_yaml::from_str(yaml).map_err(|e| {
        let location = e.location();
        vec![match location {
            Some(loc) => ParseError::at(
                format!("YAML error: {}", e),
                loc.line() as u32,
                loc.column() as u32,
            ),
            None => ParseError::new(format!("YAML error: {}", e)),
        }]
    })?;

    let mut errors = Vec::new();
    let flow = convert_flow(doc.flow, &mut errors);
    if errors.is_empty() {
        Ok(flow)
    } else {
        Err(errors)
    }
}

fn convert_flow(raw: FdlFlow, errors: &mut Vec<ParseError>) -> Flow {
    let args = raw
        .args
        .map(|a| convert_args(a, errors))
        .unwrap_or_default();

    let mut nodes = IndexMap::new();
    for (id, node) in raw.node {
        match classify_node(&id, node, errors) {
            Some(node) => {
                nodes.insert(id, node);
            }
            None => {}
        }
    }

    Flow {
        meta: FlowMeta {
            name: raw.name,
            description: raw.desp,
        },
        args,
        vars: raw.vars,
        mcp_servers: raw.mcp_servers,
        nodes,
    }
}

fn convert_args(raw: FdlArgs, errors: &mut Vec<ParseError>) -> FlowArgs {
    let mut inputs = Vec::new();
    for (name, param) in raw.inputs {
        match convert_param(&name, param) {
            Ok(param) => inputs.push(param),
            Err(e) => errors.push(e),
        }
    }

    let output = raw.out.and_then(|out| match out {
        FdlOut::Single(spec) => match TypeSpec::parse(&spec) {
            Ok(ty) => Some(OutputDef::Single(ty)),
            Err(e) => {
                errors.push(ParseError::new(format!("args.out: {}", e)));
                None
            }
        },
        FdlOut::Params(fields) => {
            let mut params = Vec::new();
            for (name, spec) in fields {
                match convert_param(&name, FdlParam::Spec(spec)) {
                    Ok(param) => params.push(param),
                    Err(e) => errors.push(e),
                }
            }
            Some(OutputDef::Params(params))
        }
    });

    let mut defs = IndexMap::new();
    for (type_name, fields) in raw.defs {
        let mut converted = IndexMap::new();
        for (field, spec) in fields {
            match TypeSpec::parse(&spec) {
                Ok(ty) => {
                    converted.insert(field, ty);
                }
                Err(e) => errors.push(ParseError::new(format!(
                    "args.defs.{}.{}: {}",
                    type_name, field, e
                ))),
            }
        }
        defs.insert(type_name, TypeDef { fields: converted });
    }

    FlowArgs {
        inputs,
        output,
        defs,
    }
}

/// Parse `"type [= default] [# description]"` (or the expanded map form).
fn convert_param(name: &str, param: FdlParam) -> Result<InputParam, ParseError> {
    let (type_src, default, description) = match param {
        FdlParam::Detailed {
            r#type,
            default,
            desp,
        } => (r#type, default, desp),
        FdlParam::Spec(spec) => {
            let (spec, description) = match spec.split_once('#') {
                Some((s, d)) => (s.to_string(), Some(d.trim().to_string())),
                None => (spec, None),
            };
            let (type_src, default) = match spec.split_once('=') {
                Some((t, d)) => (t.to_string(), Some(d.trim().to_string())),
                None => (spec, None),
            };
            (type_src, default, description)
        }
    };

    let ty = TypeSpec::parse(&type_src)
        .map_err(|e| ParseError::new(format!("args.in.{}: {}", name, e)))?;
    Ok(InputParam {
        name: name.to_string(),
        ty,
        default,
        description,
    })
}

/// Comma-separated NodeId list: trimmed, empties filtered.
fn parse_next(next: Option<&str>) -> Vec<NodeId> {
    next.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn classify_node(id: &str, raw: FdlNode, errors: &mut Vec<ParseError>) -> Option<Node> {
    let base = NodeBase {
        name: raw.name.clone(),
        description: raw.desp.clone(),
        only: raw.only.clone(),
        next: parse_next(raw.next.as_deref()),
        fail: raw.fail.clone(),
    };

    // Discriminator priority; the first matching field wins.
    let kind = if let Some(agent) = raw.agent {
        NodeKind::Agent(AgentNode {
            agent,
            args: raw.args,
            with: raw.with_expr,
        })
    } else if let Some(guard) = raw.guard {
        NodeKind::Guard(GuardNode {
            guard,
            args: raw.args,
            then: raw.then,
            r#else: raw.else_branch,
        })
    } else if let Some(approval) = raw.approval {
        NodeKind::Approval(ApprovalNode {
            approval,
            then: raw.then,
            r#else: raw.else_branch,
        })
    } else if let Some(mcp) = raw.mcp {
        NodeKind::Mcp(McpNode {
            mcp,
            args: raw.args,
            with: raw.with_expr,
        })
    } else if let Some(handoff) = raw.handoff {
        NodeKind::Handoff(HandoffNode {
            handoff,
            args: raw.args,
            with: raw.with_expr,
        })
    } else if let Some(exec) = raw.exec {
        NodeKind::Exec(ExecNode {
            exec,
            args: raw.args,
            with: raw.with_expr,
            sets: raw.sets,
        })
    } else if let Some(wait) = raw.wait {
        let wait = match wait {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                errors.push(ParseError::new(format!(
                    "node '{}': invalid wait value {:?}",
                    id, other
                )));
                return None;
            }
        };
        NodeKind::Delay(DelayNode { wait })
    } else if let Some(each) = raw.each {
        let Some(body) = raw.node else {
            errors.push(ParseError::new(format!(
                "node '{}': each requires a sub-flow under 'node'",
                id
            )));
            return None;
        };
        NodeKind::Each(EachNode {
            each,
            vars: raw.vars,
            body: convert_body(id, body, errors),
            with: raw.with_expr,
            mode: raw.mode.unwrap_or_default(),
        })
    } else if raw.vars.is_some() && raw.when.is_some() && raw.node.is_some() {
        NodeKind::Loop(LoopNode {
            vars: raw.vars.unwrap(),
            when: raw.when.unwrap(),
            body: convert_body(id, raw.node.unwrap(), errors),
            with: raw.with_expr,
        })
    } else if let Some(cases) = raw.case {
        NodeKind::Switch(SwitchNode {
            cases,
            r#else: raw.else_branch,
        })
    } else if raw.when.is_some() && raw.then.is_some() {
        NodeKind::Condition(ConditionNode {
            when: raw.when.unwrap(),
            then: raw.then.unwrap(),
            r#else: raw.else_branch,
        })
    } else if let Some(with) = raw.with_expr {
        NodeKind::Mapping(MappingNode {
            with,
            sets: raw.sets,
        })
    } else {
        // No discriminating field: a bare mapping that binds null.
        NodeKind::Mapping(MappingNode {
            with: "null".to_string(),
            sets: raw.sets,
        })
    };

    Some(Node { base, kind })
}

fn convert_body(
    parent: &str,
    body: IndexMap<String, FdlNode>,
    errors: &mut Vec<ParseError>,
) -> IndexMap<NodeId, Node> {
    let mut nodes = IndexMap::new();
    for (id, node) in body {
        if let Some(node) = classify_node(&format!("{}.{}", parent, id), node, errors) {
            nodes.insert(id, node);
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_flow() {
        let yaml = r#"
flow:
    name: minimal
    desp: smallest useful flow
    node:
        step1:
            with: result = 1 + 2
"#;
        let flow = parse_flow(yaml).unwrap();
        assert_eq!(flow.meta.name, "minimal");
        assert_eq!(flow.meta.description.as_deref(), Some("smallest useful flow"));
        assert!(matches!(
            flow.nodes.get("step1").unwrap().kind,
            NodeKind::Mapping(_)
        ));
    }

    #[test]
    fn test_parse_customer_view_flow() {
        let yaml = r#"
flow:
    name: customer-view
    desp: customer name plus order count
    args:
        in:
            customerId: string
            from: "string = DATE('-3M')"
        out:
            id: string
            name: string
            orders: int
    node:
        customer:
            name: fetch customer
            exec: api://crm-service/customer
            next: merge
        orderCount:
            name: count orders
            exec: db://ec.order/count
            args: "filter = { customerId: customerId }"
            next: merge
        merge:
            name: merge view
            with: |
                ...customer
                orders = orderCount
"#;
        let flow = parse_flow(yaml).unwrap();
        assert_eq!(flow.args.inputs.len(), 2);
        assert_eq!(flow.args.inputs[0].name, "customerId");
        assert_eq!(flow.args.inputs[1].default.as_deref(), Some("DATE('-3M')"));
        assert!(matches!(flow.args.output, Some(OutputDef::Params(ref p)) if p.len() == 3));
        assert_eq!(flow.nodes.len(), 3);
        assert_eq!(
            flow.nodes.get("customer").unwrap().base.next,
            vec!["merge".to_string()]
        );
    }

    #[test]
    fn test_classification_priority() {
        // `when`+`then` with `case` present classifies as switch, and
        // `exec` beats `with`.
        let yaml = r#"
flow:
    name: classify
    node:
        router:
            case:
                - when: x == 1
                  then: a
            else: b
        call:
            exec: api://svc/op
            with: $raw.data
        gate:
            when: x > 0
            then: a
            else: b
        a:
            with: "'a'"
        b:
            with: "'b'"
"#;
        let flow = parse_flow(yaml).unwrap();
        assert!(matches!(flow.nodes.get("router").unwrap().kind, NodeKind::Switch(_)));
        assert!(matches!(flow.nodes.get("call").unwrap().kind, NodeKind::Exec(_)));
        assert!(matches!(flow.nodes.get("gate").unwrap().kind, NodeKind::Condition(_)));
    }

    #[test]
    fn test_parse_loop_and_each() {
        let yaml = r#"
flow:
    name: iterate
    vars: "items = [1, 2, 3]"
    node:
        everyItem:
            each: "items => it, idx"
            mode: sequential
            node:
                double:
                    with: it * 2
        counter:
            vars: "i = 0"
            when: "i < 5"
            node:
                bump:
                    sets: "i = i + 1"
"#;
        let flow = parse_flow(yaml).unwrap();
        let NodeKind::Each(each) = &flow.nodes.get("everyItem").unwrap().kind else {
            panic!("expected each");
        };
        assert_eq!(each.mode, IterationMode::Sequential);
        assert!(each.body.contains_key("double"));
        assert!(matches!(flow.nodes.get("counter").unwrap().kind, NodeKind::Loop(_)));
    }

    #[test]
    fn test_parse_extended_nodes() {
        let yaml = r#"
flow:
    name: extended
    mcp_servers:
        - id: fs
          url: http://localhost:3100
    node:
        ask:
            agent:
                model: claude-sonnet
                instructions: summarize the order
                output_format: json
                temperature: 0.2
            args: "order = order"
            next: check
        check:
            guard:
                types: [pii, custom]
                action: block
                expression: "order.total > 10000"
            then: approve
            else: done
        approve:
            approval:
                title: big order
                options:
                    - id: ok
                    - id: no
                timeout: 5s
                timeout_action: reject
            then: done
        lookup:
            mcp:
                server: fs
                tool: read_file
        pass:
            handoff:
                target: billing-agent
                context: [order, customer]
                resume_on: any
        done:
            with: "'done'"
"#;
        let flow = parse_flow(yaml).unwrap();
        assert_eq!(flow.mcp_servers.len(), 1);
        assert!(matches!(flow.nodes.get("ask").unwrap().kind, NodeKind::Agent(_)));
        assert!(matches!(flow.nodes.get("check").unwrap().kind, NodeKind::Guard(_)));
        assert!(matches!(flow.nodes.get("approve").unwrap().kind, NodeKind::Approval(_)));
        assert!(matches!(flow.nodes.get("lookup").unwrap().kind, NodeKind::Mcp(_)));
        assert!(matches!(flow.nodes.get("pass").unwrap().kind, NodeKind::Handoff(_)));

        let NodeKind::Agent(agent) = &flow.nodes.get("ask").unwrap().kind else {
            unreachable!();
        };
        assert_eq!(agent.agent.output_format, OutputFormat::Json);
    }

    #[test]
    fn test_wait_accepts_number_and_string() {
        let yaml = r#"
flow:
    name: delays
    node:
        ms:
            wait: 1500
        human:
            wait: 2m
"#;
        let flow = parse_flow(yaml).unwrap();
        let NodeKind::Delay(d) = &flow.nodes.get("ms").unwrap().kind else {
            panic!();
        };
        assert_eq!(d.wait, "1500");
        let NodeKind::Delay(d) = &flow.nodes.get("human").unwrap().kind else {
            panic!();
        };
        assert_eq!(d.wait, "2m");
    }

    #[test]
    fn test_errors_are_collected() {
        let yaml = r#"
flow:
    name: broken
    args:
        in:
            a: "int?[]"
            b: "nosuch type"
    node:
        iter:
            each: "items => it"
"#;
        let errors = parse_flow(yaml).unwrap_err();
        // Two bad input types plus the each node missing its body.
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_malformed_yaml_aborts_early() {
        let errors = parse_flow("flow: [not a map").unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_next_parsing() {
        assert_eq!(
            parse_next(Some(" a , b ,, c ")),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_next(None).is_empty());
    }
}
