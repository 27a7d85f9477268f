//! Tool error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool URI: {0}")]
    InvalidUri(String),

    #[error("no handler registered for scheme '{0}'")]
    SchemeNotFound(String),

    #[error("service not configured: {scheme}://{service}")]
    ServiceNotFound { scheme: String, service: String },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("execution error: {0}")]
    Execution(String),
}

impl ToolError {
    /// Whether a retry could plausibly succeed: connection failures,
    /// timeouts and 5xx responses.
    pub fn retriable(&self) -> bool {
        match self {
            ToolError::Connection(_) | ToolError::Timeout(_) => true,
            ToolError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(ToolError::Connection("refused".into()).retriable());
        assert!(ToolError::Timeout(3000).retriable());
        assert!(
            ToolError::Http {
                status: 503,
                message: "unavailable".into()
            }
            .retriable()
        );
        assert!(
            !ToolError::Http {
                status: 404,
                message: "missing".into()
            }
            .retriable()
        );
        assert!(!ToolError::InvalidArgument("bad".into()).retriable());
        assert!(!ToolError::Cancelled.retriable());
    }
}
