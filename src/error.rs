/// Engine error taxonomy
///
/// Every failure a deploy/start/complete call can produce. The HTTP layer maps
/// these to status codes; internal plumbing (storage, bootstrap) stays on anyhow.

use thiserror::Error;

/// Convenience alias used across the engine
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed definition rejected at deploy time
    #[error("invalid process definition: {0}")]
    Parse(String),

    /// Request rejected before reaching the engine (missing required field etc.)
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("process instance not found: {0}")]
    InstanceNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Exclusive gateway with neither a matching condition nor a default flow
    #[error("no outgoing flow of '{node_id}' could be taken")]
    NoMatchingFlow { node_id: String },

    #[error("advance exceeded {limit} steps without reaching a wait state or end event")]
    InfiniteLoopDetected { limit: usize },

    #[error("process instance is suspended: {0}")]
    InstanceSuspended(String),

    #[error("expression '{expression}' failed: {reason}")]
    ExpressionError { expression: String, reason: String },

    #[error("no delegate registered under '{0}'")]
    DelegateNotFound(String),

    #[error("delegate '{delegate}' failed: {reason}")]
    DelegateFailed { delegate: String, reason: String },

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn expression(expression: &str, reason: impl ToString) -> Self {
        Self::ExpressionError {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }
}
