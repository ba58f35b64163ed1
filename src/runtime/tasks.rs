/// Outstanding user tasks
///
/// Tasks are created and removed only by the engine, while it holds the lock of
/// the owning instance, or restored from the database at startup. Readers get
/// clones.

use crate::process::types::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A parked user-task position waiting for a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: Option<String>,
    pub process_instance_id: String,
    pub process_definition_id: String,
    /// User task node id
    #[serde(rename = "taskDefinitionKey")]
    pub node_id: String,
    pub assignee: Option<String>,
    /// Instance variables when the task was created
    pub variables: Variables,
    pub create_time: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: i32,
}

/// In-memory task table
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks assigned to `user_id`, newest first
    pub async fn list_by_assignee(&self, user_id: &str) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut assigned: Vec<Task> = tasks
            .values()
            .filter(|task| task.assignee.as_deref() == Some(user_id))
            .cloned()
            .collect();

        assigned.sort_by(|a, b| {
            b.create_time
                .cmp(&a.create_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        assigned
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Remove `removed` and insert `created` under a single write lock
    pub(crate) async fn apply(&self, removed: Option<&str>, created: Vec<Task>) {
        let mut tasks = self.tasks.write().await;
        if let Some(task_id) = removed {
            tasks.remove(task_id);
        }
        for task in created {
            tracing::info!(
                "📋 Task '{}' ({}) created for {}",
                task.node_id,
                task.id,
                task.assignee.as_deref().unwrap_or("nobody")
            );
            tasks.insert(task.id.clone(), task);
        }
    }

    /// Reload persisted tasks
    pub(crate) async fn restore(&self, restored: Vec<Task>) {
        let mut tasks = self.tasks.write().await;
        tasks.extend(restored.into_iter().map(|task| (task.id.clone(), task)));
    }
}
