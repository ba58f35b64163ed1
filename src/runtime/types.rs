/// Runtime state types
///
/// A `ProcessInstance` is the live, mutable state of one execution. Views and
/// requests are the camelCase shapes exchanged over HTTP.

use crate::error::{EngineError, EngineResult};
use crate::process::types::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One running execution of a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_key: String,
    pub definition_name: Option<String>,
    pub business_key: Option<String>,
    pub name: Option<String>,
    pub start_user_id: String,
    pub start_time: DateTime<Utc>,
    /// One entry per parked branch; may repeat a node id
    pub current_node_ids: Vec<String>,
    pub variables: Variables,
    pub suspended: bool,
    pub ended: bool,
    pub end_time: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn view(&self) -> ProcessInstanceView {
        ProcessInstanceView {
            id: self.id.clone(),
            process_definition_id: self.definition_id.clone(),
            process_definition_key: self.definition_key.clone(),
            process_definition_name: self.definition_name.clone(),
            business_key: self.business_key.clone(),
            name: self.name.clone(),
            start_user_id: self.start_user_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            suspended: self.suspended,
            ended: self.ended,
            current_node_ids: self.current_node_ids.clone(),
            variables: self.variables.clone(),
        }
    }

    /// Remove a single parked position for `node_id`
    pub(crate) fn release_position(&mut self, node_id: &str) -> bool {
        match self.current_node_ids.iter().position(|id| id == node_id) {
            Some(index) => {
                self.current_node_ids.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Serializable snapshot of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstanceView {
    pub id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub process_definition_name: Option<String>,
    pub business_key: Option<String>,
    pub name: Option<String>,
    pub start_user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub suspended: bool,
    pub ended: bool,
    pub current_node_ids: Vec<String>,
    pub variables: Variables,
}

/// Request to start a new instance of the latest version of a key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessRequest {
    #[serde(default)]
    pub process_definition_key: String,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub process_instance_name: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub start_user_id: String,
}

impl StartProcessRequest {
    pub fn new(key: impl Into<String>, start_user_id: impl Into<String>) -> Self {
        Self {
            process_definition_key: key.into(),
            start_user_id: start_user_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.process_definition_key.trim().is_empty() {
            return Err(EngineError::Validation(
                "processDefinitionKey must not be empty".to_string(),
            ));
        }
        if self.start_user_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "startUserId must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request to complete an outstanding user task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskRequest {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub user_id: String,
}

impl CompleteTaskRequest {
    pub fn new(task_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.task_id.trim().is_empty() {
            return Err(EngineError::Validation("taskId must not be empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(EngineError::Validation("userId must not be empty".to_string()));
        }
        Ok(())
    }

    /// Variables to merge into the instance, `approved` included
    pub fn completion_variables(&self) -> Variables {
        let mut variables = self.variables.clone();
        if let Some(approved) = self.approved {
            variables.insert("approved".to_string(), serde_json::Value::Bool(approved));
        }
        variables
    }
}
