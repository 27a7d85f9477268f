//! GML error types.

use thiserror::Error;

/// GML error type. Lex/parse errors carry line and column (1-based).
#[derive(Debug, Clone, Error)]
pub enum GmlError {
    #[error("lex error at {line}:{column}: {message}")]
    Lex {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("undefined function: {0}")]
    UndefinedFunction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("expression recursion depth exceeded")]
    RecursionLimit,
}

pub type GmlResult<T> = Result<T, GmlError>;
