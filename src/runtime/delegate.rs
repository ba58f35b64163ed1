/// Service-task delegates
///
/// A delegate is a named capability the engine calls when execution reaches a
/// service task. Delegates are registered by string identifier and looked up at
/// runtime; they receive a read-only view of the instance and return the
/// variable updates to merge back into it.

use crate::error::{EngineError, EngineResult};
use crate::process::types::Variables;
use serde_json::json;
use std::{collections::HashMap, fmt, sync::Arc};

/// What a delegate sees of the instance it runs for
#[derive(Debug, Clone, Copy)]
pub struct DelegateExecution<'a> {
    pub instance_id: &'a str,
    pub business_key: Option<&'a str>,
    /// Service task node id
    pub node_id: &'a str,
    pub variables: &'a Variables,
}

/// Service-task behaviour
///
/// Must be quick and synchronous: the engine calls it while staging a transition.
pub trait Delegate: Send + Sync {
    /// Run the delegate and return variable updates
    fn execute(&self, execution: &DelegateExecution<'_>) -> anyhow::Result<Variables>;
}

/// Identifier -> delegate lookup table
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn Delegate>>,
}

impl fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.delegates.keys().collect();
        ids.sort();
        f.debug_struct("DelegateRegistry").field("delegates", &ids).finish()
    }
}

impl DelegateRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the approval delegates used by the bundled processes
    pub fn with_builtin() -> Self {
        Self::new()
            .register("approvalSuccessDelegate", ApprovalSuccessDelegate)
            .register("approvalRejectDelegate", ApprovalRejectDelegate)
    }

    pub fn register(mut self, id: impl Into<String>, delegate: impl Delegate + 'static) -> Self {
        self.delegates.insert(id.into(), Arc::new(delegate));
        self
    }

    /// Look up and run a delegate
    pub fn invoke(&self, id: &str, execution: &DelegateExecution<'_>) -> EngineResult<Variables> {
        let delegate = self
            .delegates
            .get(id)
            .ok_or_else(|| EngineError::DelegateNotFound(id.to_string()))?;

        tracing::debug!(
            "⚙️ Invoking delegate '{}' for instance {} at '{}'",
            id,
            execution.instance_id,
            execution.node_id
        );

        delegate.execute(execution).map_err(|e| EngineError::DelegateFailed {
            delegate: id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Marks the instance as approved
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalSuccessDelegate;

impl Delegate for ApprovalSuccessDelegate {
    fn execute(&self, execution: &DelegateExecution<'_>) -> anyhow::Result<Variables> {
        tracing::info!(
            "✅ Approval granted - instance: {}, business key: {}",
            execution.instance_id,
            execution.business_key.unwrap_or("-")
        );

        let mut updates = Variables::new();
        updates.insert("finalResult".to_string(), json!("approved"));
        updates.insert(
            "approvalTime".to_string(),
            json!(chrono::Utc::now().timestamp_millis()),
        );
        Ok(updates)
    }
}

/// Marks the instance as rejected
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalRejectDelegate;

impl Delegate for ApprovalRejectDelegate {
    fn execute(&self, execution: &DelegateExecution<'_>) -> anyhow::Result<Variables> {
        tracing::info!(
            "❌ Approval rejected - instance: {}, business key: {}",
            execution.instance_id,
            execution.business_key.unwrap_or("-")
        );

        let mut updates = Variables::new();
        updates.insert("finalResult".to_string(), json!("rejected"));
        updates.insert(
            "rejectTime".to_string(),
            json!(chrono::Utc::now().timestamp_millis()),
        );
        Ok(updates)
    }
}
