/// Runtime Execution Engine
///
/// This module drives process instances through their definition graphs.
/// It handles:
/// - Starting instances and completing user tasks
/// - Expression evaluation for conditions and assignees (sandboxed Lua)
/// - Service-task delegates
/// - The outstanding task table and the append-only history log

// Token traversal over a definition graph
mod advance;

// Delegates invoked by service tasks
pub mod delegate;

// Instance lifecycle and per-instance locking
pub mod engine;

// Condition and assignee expressions
pub mod expression;

// Append-only event log and instance projection
pub mod history;

// Outstanding user tasks
pub mod tasks;

// Instance state, views and requests
pub mod types;

// Re-export main types
pub use delegate::{Delegate, DelegateExecution, DelegateRegistry};
pub use engine::ProcessEngine;
pub use history::{HistoryEvent, HistoryEventType, HistoryLog};
pub use tasks::{Task, TaskRegistry};
pub use types::{CompleteTaskRequest, ProcessInstance, ProcessInstanceView, StartProcessRequest};
