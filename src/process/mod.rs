/// Process Definition Layer
///
/// This module handles process definitions from upload to executable graph:
/// - Type definitions (ProcessModel, Node, SequenceFlow, ProcessDefinition)
/// - BPMN 2.0 XML and JSON parsing
/// - petgraph compilation and structural validation
/// - Versioned, lock-free definition registry using ArcSwap

// Core process type definitions
pub mod types;

// BPMN XML / JSON resource parsing
pub mod parser;

// Validated petgraph form of a process
pub mod graph;

// Versioned registry backed by SQLite
pub mod registry;

// Re-export commonly used types
pub use graph::ProcessGraph;
pub use registry::{CompiledDefinition, DefinitionRegistry};
pub use types::{
    Deployment, Node, NodeKind, ProcessDefinition, ProcessDefinitionView, ProcessModel,
    SequenceFlow, Variables,
};
