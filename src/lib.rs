/// procflow: embeddable BPMN process engine
///
/// This library provides versioned process definitions (BPMN 2.0 XML or JSON),
/// a petgraph-based execution engine with user tasks, service-task delegates and
/// exclusive gateways, an append-only SQLite history log and a REST API.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// SQLite persistence for deployments and history
pub mod storage;

// Process definitions - types, parsing, graph compilation and versioned registry
pub mod process;

// Runtime execution engine - instances, tasks, delegates, expressions, history
pub mod runtime;

// Diagram rendering
pub mod diagram;

// HTTP API layer - REST endpoints for deployment, instances and tasks
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use process::{Node, NodeKind, ProcessDefinition, ProcessModel, SequenceFlow, Variables};
pub use runtime::{
    CompleteTaskRequest, Delegate, DelegateExecution, DelegateRegistry, ProcessEngine,
    ProcessInstanceView, StartProcessRequest, Task,
};
pub use server::{create_app, start_server};
