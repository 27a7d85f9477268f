//! Dependency graph builder.
//!
//! Derives forward/reverse adjacency, in-degrees and roots from a node
//! map in a single pass, validates references and rejects cycles by DFS
//! colouring. Failure edges are excluded from dependency accounting: they
//! only become live when their source node fails.

use crate::error::{EngineError, EngineResult, SchedulingError};
use crate::flow::{Node, NodeId, NodeKind};
use indexmap::IndexMap;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Unconditional `next` edge.
    Sequential,
    /// Conditional edge from Condition/Switch/Guard/Approval; satisfied
    /// only along the branch actually taken.
    Branch,
    /// `fail` edge; traversed only when the source node fails.
    Failure,
}

#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    pub forward: HashMap<NodeId, Vec<Edge>>,
    pub reverse: HashMap<NodeId, Vec<Edge>>,
    /// Count of incoming Sequential + Branch edges.
    pub in_degree: HashMap<NodeId, usize>,
    /// Count of incoming Failure edges.
    pub fail_in_degree: HashMap<NodeId, usize>,
    /// Nodes with no mandatory and no failure predecessors, in
    /// declaration order.
    pub roots: Vec<NodeId>,
}

impl DepGraph {
    pub fn build(nodes: &IndexMap<NodeId, Node>) -> EngineResult<Self> {
        let mut graph = DepGraph::default();
        for id in nodes.keys() {
            graph.forward.insert(id.clone(), Vec::new());
            graph.reverse.insert(id.clone(), Vec::new());
            graph.in_degree.insert(id.clone(), 0);
            graph.fail_in_degree.insert(id.clone(), 0);
        }

        let mut missing = Vec::new();
        let mut add_edge = |graph: &mut DepGraph, from: &NodeId, to: &NodeId, kind: EdgeKind| {
            if !nodes.contains_key(to) {
                missing.push(format!("{} -> {}", from, to));
                return;
            }
            let edge = Edge {
                from: from.clone(),
                to: to.clone(),
                kind,
            };
            graph.forward.get_mut(from).unwrap().push(edge.clone());
            graph.reverse.get_mut(to).unwrap().push(edge);
            match kind {
                EdgeKind::Failure => {
                    *graph.fail_in_degree.get_mut(to).unwrap() += 1;
                }
                _ => {
                    *graph.in_degree.get_mut(to).unwrap() += 1;
                }
            }
        };

        for (id, node) in nodes {
            for next in &node.base.next {
                add_edge(&mut graph, id, next, EdgeKind::Sequential);
            }
            for target in node.kind.branch_targets() {
                add_edge(&mut graph, id, target, EdgeKind::Branch);
            }
            if let Some(fail) = &node.base.fail {
                add_edge(&mut graph, id, fail, EdgeKind::Failure);
            }
        }

        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "unknown node references: {}",
                missing.join(", ")
            )));
        }

        graph.roots = nodes
            .keys()
            .filter(|id| graph.in_degree[*id] == 0 && graph.fail_in_degree[*id] == 0)
            .cloned()
            .collect();

        graph.check_acyclic(nodes)?;
        Ok(graph)
    }

    /// Nodes with two or more mandatory predecessors; the scheduler joins
    /// on them.
    pub fn convergence_points(&self) -> Vec<&NodeId> {
        self.in_degree
            .iter()
            .filter(|(_, degree)| **degree >= 2)
            .map(|(id, _)| id)
            .collect()
    }

    /// DFS colouring over Sequential + Branch edges. Failure edges are
    /// excluded; routing back to a handler is not a dependency cycle.
    fn check_acyclic(&self, nodes: &IndexMap<NodeId, Node>) -> EngineResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colours: HashMap<&NodeId, Colour> =
            nodes.keys().map(|id| (id, Colour::White)).collect();

        fn visit<'a>(
            id: &'a NodeId,
            forward: &'a HashMap<NodeId, Vec<Edge>>,
            colours: &mut HashMap<&'a NodeId, Colour>,
        ) -> Result<(), NodeId> {
            colours.insert(id, Colour::Grey);
            for edge in &forward[id] {
                if edge.kind == EdgeKind::Failure {
                    continue;
                }
                match colours[&edge.to] {
                    Colour::Grey => return Err(edge.to.clone()),
                    Colour::White => visit(&edge.to, forward, colours)?,
                    Colour::Black => {}
                }
            }
            colours.insert(id, Colour::Black);
            Ok(())
        }

        for id in nodes.keys() {
            if colours[id] == Colour::White {
                if let Err(offender) = visit(id, &self.forward, &mut colours) {
                    return Err(SchedulingError::CycleDetected(offender).into());
                }
            }
        }
        Ok(())
    }
}

/// Validate a node map and, recursively, every Each/Loop body.
pub fn validate_nodes(nodes: &IndexMap<NodeId, Node>) -> EngineResult<()> {
    DepGraph::build(nodes)?;
    for (id, node) in nodes {
        if let Some(body) = node.kind.body() {
            if body.is_empty() {
                return Err(EngineError::Validation(format!(
                    "node '{}' has an empty sub-flow",
                    id
                )));
            }
            validate_nodes(body)?;
        }
        if let NodeKind::Switch(switch) = &node.kind {
            if switch.cases.is_empty() {
                return Err(EngineError::Validation(format!(
                    "switch node '{}' has no cases",
                    id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ConditionNode, MappingNode, Node, NodeBase};

    fn mapping(next: &[&str]) -> Node {
        Node {
            base: NodeBase {
                next: next.iter().map(|s| s.to_string()).collect(),
                ..NodeBase::default()
            },
            kind: NodeKind::Mapping(MappingNode {
                with: "1".to_string(),
                sets: None,
            }),
        }
    }

    fn nodes(entries: Vec<(&str, Node)>) -> IndexMap<NodeId, Node> {
        entries
            .into_iter()
            .map(|(id, node)| (id.to_string(), node))
            .collect()
    }

    #[test]
    fn test_roots_and_in_degrees() {
        let map = nodes(vec![
            ("a", mapping(&["c"])),
            ("b", mapping(&["c"])),
            ("c", mapping(&[])),
        ]);
        let graph = DepGraph::build(&map).unwrap();
        assert_eq!(graph.roots, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(graph.in_degree["c"], 2);
        assert_eq!(graph.convergence_points(), vec![&"c".to_string()]);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let map = nodes(vec![("a", mapping(&["ghost"]))]);
        assert!(matches!(
            DepGraph::build(&map),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let map = nodes(vec![
            ("a", mapping(&["b"])),
            ("b", mapping(&["c"])),
            ("c", mapping(&["a"])),
        ]);
        assert!(matches!(
            DepGraph::build(&map),
            Err(EngineError::Scheduling(SchedulingError::CycleDetected(_)))
        ));
    }

    #[test]
    fn test_fail_edge_not_a_dependency_or_cycle() {
        let mut handler = mapping(&[]);
        handler.base.next = vec![];
        let mut risky = mapping(&["done"]);
        risky.base.fail = Some("handler".to_string());
        let map = nodes(vec![
            ("risky", risky),
            ("handler", handler),
            ("done", mapping(&[])),
        ]);
        let graph = DepGraph::build(&map).unwrap();
        // The handler is not a root: it waits on the failure edge.
        assert_eq!(graph.roots, vec!["risky".to_string()]);
        assert_eq!(graph.in_degree["handler"], 0);
        assert_eq!(graph.fail_in_degree["handler"], 1);
    }

    #[test]
    fn test_branch_edges_counted() {
        let gate = Node {
            base: NodeBase::default(),
            kind: NodeKind::Condition(ConditionNode {
                when: "true".to_string(),
                then: "a".to_string(),
                r#else: Some("b".to_string()),
            }),
        };
        let map = nodes(vec![("gate", gate), ("a", mapping(&[])), ("b", mapping(&[]))]);
        let graph = DepGraph::build(&map).unwrap();
        assert_eq!(graph.in_degree["a"], 1);
        assert_eq!(graph.in_degree["b"], 1);
        assert_eq!(graph.roots, vec!["gate".to_string()]);
    }
}
