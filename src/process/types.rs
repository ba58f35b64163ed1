/// Process definition type definitions
///
/// Models deployed process definitions as plain serde structures: nodes, sequence
/// flows and the versioned definition record. Definitions are persisted as JSON in
/// SQLite and compiled into petgraph arenas (see `graph.rs`) for execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process/instance variables (name -> JSON value)
pub type Variables = serde_json::Map<String, Value>;

/// Default task priority, same as the BPMN engines this service replaces
pub const DEFAULT_TASK_PRIORITY: i32 = 50;

/// A parsed process: the graph of nodes and the flows connecting them
///
/// Produced by the BPMN/JSON parser and never mutated afterwards. The JSON
/// deployment format is exactly the serde form of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    /// Process key (BPMN `process@id`), e.g. "leaveApproval"
    pub key: String,
    /// Human-readable process name
    #[serde(default)]
    pub name: Option<String>,
    /// Free text taken from the process `documentation` element
    #[serde(default)]
    pub description: Option<String>,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Sequence flows in declaration order (order matters for gateways)
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

/// A single node of the process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the process (e.g. "approveTask")
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Node behaviour, tagged by `type` in JSON
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// The five node kinds the engine executes
///
/// JSON form: `{ "id": "approve", "type": "userTask", "assignee": "${startUserId}" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeKind {
    /// Entry point, exactly one per process
    StartEvent,

    /// Human task - execution waits here until the task is completed
    /// Assignee is a literal user id or an expression like "${startUserId}"
    UserTask {
        #[serde(default)]
        assignee: Option<String>,
        #[serde(default = "default_priority")]
        priority: i32,
        #[serde(default)]
        due_in_hours: Option<i64>,
    },

    /// Automatic step that invokes a registered delegate by identifier
    ServiceTask { delegate: String },

    /// XOR split: first outgoing flow whose condition holds, else the default flow
    ExclusiveGateway {
        #[serde(default)]
        default_flow: Option<String>,
    },

    /// Terminates the branch that reaches it
    EndEvent,
}

fn default_priority() -> i32 {
    DEFAULT_TASK_PRIORITY
}

impl NodeKind {
    /// Short label used in logs and diagrams
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "startEvent",
            NodeKind::UserTask { .. } => "userTask",
            NodeKind::ServiceTask { .. } => "serviceTask",
            NodeKind::ExclusiveGateway { .. } => "exclusiveGateway",
            NodeKind::EndEvent => "endEvent",
        }
    }
}

impl Node {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Directed edge between two nodes
///
/// The optional condition is an expression over instance variables such as
/// "${approved == true}". Flows without a condition are always taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    /// Source node ID
    #[serde(alias = "from")]
    pub source: String,
    /// Target node ID
    #[serde(alias = "to")]
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}

/// One upload of one resource; may carry several process definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    /// Uploaded resource name (e.g. "leave.bpmn20.xml")
    pub name: String,
    pub deploy_time: DateTime<Utc>,
}

/// A deployed, versioned and immutable process definition
///
/// Redeploying the same key produces a new definition with version + 1; older
/// versions stay available for instances already running on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// "{key}:{version}:{deployment_id}"
    pub id: String,
    pub key: String,
    pub version: i32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub resource_name: String,
    pub deployment_id: String,
    /// Kept for API compatibility; definitions are never suspended by this engine
    pub suspended: bool,
    pub model: ProcessModel,
}

impl ProcessDefinition {
    pub fn definition_id(key: &str, version: i32, deployment_id: &str) -> String {
        format!("{}:{}:{}", key, version, deployment_id)
    }

    /// Listing view returned by the definitions endpoint
    pub fn view(&self) -> ProcessDefinitionView {
        ProcessDefinitionView {
            id: self.id.clone(),
            key: self.key.clone(),
            name: self.name.clone(),
            version: self.version,
            deployment_id: self.deployment_id.clone(),
            resource_name: self.resource_name.clone(),
            description: self.description.clone(),
            suspended: self.suspended,
        }
    }
}

/// Process definition as exposed over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinitionView {
    pub id: String,
    pub key: String,
    pub name: Option<String>,
    pub version: i32,
    pub deployment_id: String,
    pub resource_name: String,
    pub description: Option<String>,
    pub suspended: bool,
}
