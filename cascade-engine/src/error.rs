//! Engine error types: the closed set surfaced to embedders.

use cascade_gml::GmlError;
use cascade_tools::ToolError;
use std::fmt;
use thiserror::Error;

/// A single flow-definition parse problem with an optional source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "{} (at {}:{})", self.message, line, column)
            }
            _ => write!(f, "{}", self.message),
        }
    }
}

impl From<&GmlError> for ParseError {
    fn from(err: &GmlError) -> Self {
        match err {
            GmlError::Lex { line, column, message }
            | GmlError::Parse { line, column, message } => {
                ParseError::at(message.clone(), *line, *column)
            }
            other => ParseError::new(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("loop bound exceeded at node '{node_id}' after {bound} iterations")]
    LoopBoundExceeded { node_id: String, bound: u32 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow definition invalid: {}", format_parse_errors(.0))]
    Parse(Vec<ParseError>),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Eval(#[from] GmlError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("node '{node_id}' failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("state error: {0}")]
    State(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl EngineError {
    /// Wrap a lower-level error with the failing node's identity.
    pub fn at_node(node_id: impl Into<String>, source: EngineError) -> Self {
        EngineError::Node {
            node_id: node_id.into(),
            source: Box::new(source),
        }
    }

    /// The innermost failing node, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineError::Node { node_id, source } => {
                Some(source.node_id().unwrap_or(node_id))
            }
            _ => None,
        }
    }
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::at("unexpected token", 3, 7);
        assert_eq!(err.to_string(), "unexpected token (at 3:7)");
        assert_eq!(ParseError::new("oops").to_string(), "oops");
    }

    #[test]
    fn test_node_error_unwraps_innermost() {
        let inner = EngineError::at_node("leaf", EngineError::Validation("bad".into()));
        let outer = EngineError::at_node("wrapper", inner);
        assert_eq!(outer.node_id(), Some("leaf"));
    }
}
