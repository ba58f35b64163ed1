/// Append-only history log
///
/// Every state change of an instance is recorded as an immutable event. The
/// log is the only place finished instances live on: once an instance ends it
/// leaves the engine's live table and is reconstructed from its events. Running
/// instances are stored with the events that moved them (`InstanceSnapshot`).

use crate::error::{EngineError, EngineResult};
use crate::process::types::Variables;
use crate::runtime::types::ProcessInstanceView;
use crate::storage::{InstanceSnapshot, ProcessStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Kind of history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    Started,
    TaskCreated,
    TaskCompleted,
    Suspended,
    Activated,
    Ended,
}

impl HistoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEventType::Started => "started",
            HistoryEventType::TaskCreated => "task_created",
            HistoryEventType::TaskCompleted => "task_completed",
            HistoryEventType::Suspended => "suspended",
            HistoryEventType::Activated => "activated",
            HistoryEventType::Ended => "ended",
        }
    }
}

impl fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryEventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(HistoryEventType::Started),
            "task_created" => Ok(HistoryEventType::TaskCreated),
            "task_completed" => Ok(HistoryEventType::TaskCompleted),
            "suspended" => Ok(HistoryEventType::Suspended),
            "activated" => Ok(HistoryEventType::Activated),
            "ended" => Ok(HistoryEventType::Ended),
            other => Err(anyhow::anyhow!("Unknown history event type '{}'", other)),
        }
    }
}

/// One immutable history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    /// Assigned by storage on append; 0 until then
    pub seq: i64,
    pub instance_id: String,
    pub event_type: HistoryEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl HistoryEvent {
    pub fn new(instance_id: impl Into<String>, event_type: HistoryEventType, payload: Value) -> Self {
        Self {
            seq: 0,
            instance_id: instance_id.into(),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn payload_str(&self, field: &str) -> Option<String> {
        self.payload.get(field).and_then(Value::as_str).map(str::to_string)
    }
}

/// History log backed by SQLite
#[derive(Debug, Clone)]
pub struct HistoryLog {
    storage: ProcessStorage,
}

impl HistoryLog {
    pub fn new(storage: ProcessStorage) -> Self {
        Self { storage }
    }

    /// Append events atomically; returns them with their sequence numbers
    ///
    /// A snapshot is persisted in the same transaction, so the stored instance
    /// state never runs ahead of or behind its history.
    pub async fn record(
        &self,
        events: Vec<HistoryEvent>,
        snapshot: Option<InstanceSnapshot<'_>>,
    ) -> EngineResult<Vec<HistoryEvent>> {
        if events.is_empty() && snapshot.is_none() {
            return Ok(events);
        }
        let stored = self.storage.append_history(events, snapshot).await?;
        tracing::debug!("📝 Recorded {} history events", stored.len());
        Ok(stored)
    }

    /// Events of one instance in insertion order
    pub async fn events_for_instance(&self, instance_id: &str) -> EngineResult<Vec<HistoryEvent>> {
        Ok(self.storage.load_history(instance_id).await?)
    }

    /// Rebuild an instance view from its events
    pub async fn query_by_instance(&self, instance_id: &str) -> EngineResult<ProcessInstanceView> {
        let events = self.events_for_instance(instance_id).await?;
        project(instance_id, &events)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }
}

/// Fold an instance's events into a view; `None` without a `started` event
pub fn project(instance_id: &str, events: &[HistoryEvent]) -> Option<ProcessInstanceView> {
    let started = events
        .iter()
        .find(|event| event.event_type == HistoryEventType::Started)?;

    let mut view = ProcessInstanceView {
        id: instance_id.to_string(),
        process_definition_id: started.payload_str("processDefinitionId").unwrap_or_default(),
        process_definition_key: started.payload_str("processDefinitionKey").unwrap_or_default(),
        process_definition_name: started.payload_str("processDefinitionName"),
        business_key: started.payload_str("businessKey"),
        name: started.payload_str("name"),
        start_user_id: started.payload_str("startUserId").unwrap_or_default(),
        start_time: started.timestamp,
        end_time: None,
        suspended: false,
        ended: false,
        current_node_ids: Vec::new(),
        variables: Variables::new(),
    };

    for event in events {
        match event.event_type {
            HistoryEventType::Started => {}
            HistoryEventType::TaskCreated => {
                if let Some(node_id) = event.payload_str("nodeId") {
                    view.current_node_ids.push(node_id);
                }
            }
            HistoryEventType::TaskCompleted => {
                if let Some(node_id) = event.payload_str("nodeId") {
                    if let Some(index) = view.current_node_ids.iter().position(|id| *id == node_id) {
                        view.current_node_ids.remove(index);
                    }
                }
            }
            HistoryEventType::Suspended => view.suspended = true,
            HistoryEventType::Activated => view.suspended = false,
            HistoryEventType::Ended => {
                view.ended = true;
                view.end_time = Some(event.timestamp);
                view.current_node_ids.clear();
            }
        }

        if let Some(Value::Object(variables)) = event.payload.get("variables") {
            view.variables = variables.clone();
        }
    }

    Some(view)
}
