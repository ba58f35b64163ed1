/// Process execution engine
///
/// Owns the live instance table and drives instances through their definition
/// graphs. Each live instance sits behind its own `tokio::sync::Mutex`, so
/// operations on one instance serialize while different instances run in
/// parallel. Every transition is staged on a copy of the instance and only
/// committed (instance state, task table) once its history events and the
/// resulting instance snapshot are stored. Running instances and their tasks
/// are reloaded from the database by `init_from_storage`.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::process::graph::ProcessGraph;
use crate::process::registry::DefinitionRegistry;
use crate::process::types::Variables;
use crate::runtime::advance::{Advance, Entry};
use crate::runtime::delegate::DelegateRegistry;
use crate::runtime::history::{HistoryEvent, HistoryEventType, HistoryLog};
use crate::runtime::tasks::{Task, TaskRegistry};
use crate::runtime::types::{
    CompleteTaskRequest, ProcessInstance, ProcessInstanceView, StartProcessRequest,
};
use crate::storage::{InstanceSnapshot, ProcessStorage};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type InstanceHandle = Arc<Mutex<ProcessInstance>>;

/// Executes process instances against deployed definitions
#[derive(Debug)]
pub struct ProcessEngine {
    /// Deployed definitions (lock-free reads)
    definitions: Arc<DefinitionRegistry>,
    /// Service-task delegates by identifier
    delegates: DelegateRegistry,
    /// Outstanding user tasks
    tasks: TaskRegistry,
    /// Append-only event log, also persisting running instance snapshots
    history: HistoryLog,
    storage: ProcessStorage,
    /// Live (not yet ended) instances
    instances: RwLock<HashMap<String, InstanceHandle>>,
    config: EngineConfig,
}

impl ProcessEngine {
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        delegates: DelegateRegistry,
        storage: ProcessStorage,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            delegates,
            tasks: TaskRegistry::new(),
            history: HistoryLog::new(storage.clone()),
            storage,
            instances: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.definitions
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Reload running instances and their open tasks from the database
    ///
    /// Call once at startup, before serving requests. Returns the number of
    /// instances restored.
    pub async fn init_from_storage(&self) -> EngineResult<usize> {
        let instances = self.storage.load_running_instances().await?;
        let tasks = self.storage.load_tasks().await?;

        let mut table = self.instances.write().await;
        for instance in instances {
            if self.definitions.get(&instance.definition_id).is_err() {
                tracing::warn!(
                    "⚠️ Instance {} references unknown definition {}",
                    instance.id,
                    instance.definition_id
                );
            }
            table.insert(instance.id.clone(), Arc::new(Mutex::new(instance)));
        }

        let (tasks, orphans): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|task| table.contains_key(&task.process_instance_id));
        for orphan in &orphans {
            tracing::warn!(
                "⚠️ Dropping task {} of unknown instance {}",
                orphan.id,
                orphan.process_instance_id
            );
        }

        let restored = table.len();
        drop(table);

        tracing::info!(
            "🔄 Restored {} running instances with {} open tasks",
            restored,
            tasks.len()
        );
        self.tasks.restore(tasks).await;

        Ok(restored)
    }

    /// Start a new instance of the latest version of `process_definition_key`
    pub async fn start(&self, request: StartProcessRequest) -> EngineResult<ProcessInstanceView> {
        request.validate()?;
        let compiled = self.definitions.latest(&request.process_definition_key)?;
        let definition = &compiled.definition;

        let mut variables = request.variables;
        variables.insert(
            "startUserId".to_string(),
            Value::String(request.start_user_id.clone()),
        );

        let mut instance = ProcessInstance {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_key: definition.key.clone(),
            definition_name: definition.name.clone(),
            business_key: request.business_key,
            name: request.process_instance_name,
            start_user_id: request.start_user_id,
            start_time: chrono::Utc::now(),
            current_node_ids: Vec::new(),
            variables,
            suspended: false,
            ended: false,
            end_time: None,
        };

        tracing::info!(
            "🚀 Starting instance {} of '{}' v{} for {}",
            instance.id,
            definition.key,
            definition.version,
            instance.start_user_id
        );

        let started = HistoryEvent::new(
            &instance.id,
            HistoryEventType::Started,
            json!({
                "processDefinitionId": instance.definition_id,
                "processDefinitionKey": instance.definition_key,
                "processDefinitionName": instance.definition_name,
                "businessKey": instance.business_key,
                "name": instance.name,
                "startUserId": instance.start_user_id,
                "variables": instance.variables,
            }),
        )
        .at(instance.start_time);

        let transition = self
            .advance(&compiled.graph)
            .run(&mut instance, Entry::Start)
            .map_err(|e| {
                tracing::warn!("❌ Start of '{}' failed: {}", definition.key, e);
                e
            })?;

        let mut events = Vec::with_capacity(transition.events.len() + 1);
        events.push(started);
        events.extend(transition.events);
        self.history
            .record(
                events,
                Some(InstanceSnapshot {
                    instance: &instance,
                    removed_task: None,
                    created_tasks: &transition.created_tasks,
                }),
            )
            .await?;

        let view = instance.view();
        if instance.ended {
            tracing::info!("🏁 Instance {} completed during start", instance.id);
            return Ok(view);
        }

        // Publish the instance before its tasks so a completion never sees an orphan task
        let id = instance.id.clone();
        let handle = Arc::new(Mutex::new(instance));
        let guard = handle.lock().await;
        self.instances.write().await.insert(id, Arc::clone(&handle));
        self.tasks.apply(None, transition.created_tasks).await;
        drop(guard);

        Ok(view)
    }

    /// Complete a user task, merge its variables and advance the instance
    pub async fn complete(&self, request: CompleteTaskRequest) -> EngineResult<ProcessInstanceView> {
        request.validate()?;
        let task_id = request.task_id.as_str();

        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let handle = self
            .live_instance(&task.process_instance_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        let mut guard = handle.lock().await;

        // Re-check under the instance lock: a concurrent completion may have won
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if guard.suspended {
            return Err(EngineError::InstanceSuspended(guard.id.clone()));
        }

        let compiled = self.definitions.get(&guard.definition_id)?;

        let mut staged = guard.clone();
        staged.variables.extend(request.completion_variables());
        staged.release_position(&task.node_id);

        let completed = HistoryEvent::new(
            &staged.id,
            HistoryEventType::TaskCompleted,
            json!({
                "taskId": task.id,
                "nodeId": task.node_id,
                "userId": request.user_id,
                "comment": request.comment,
                "variables": staged.variables,
            }),
        );

        let transition = self
            .advance(&compiled.graph)
            .run(&mut staged, Entry::Leave(&task.node_id))
            .map_err(|e| {
                tracing::warn!("❌ Completion of task {} failed: {}", task.id, e);
                e
            })?;

        let mut events = Vec::with_capacity(transition.events.len() + 1);
        events.push(completed);
        events.extend(transition.events);
        self.history
            .record(
                events,
                Some(InstanceSnapshot {
                    instance: &staged,
                    removed_task: Some(task.id.as_str()),
                    created_tasks: &transition.created_tasks,
                }),
            )
            .await?;

        tracing::info!(
            "✅ Task '{}' ({}) completed by {}",
            task.node_id,
            task.id,
            request.user_id
        );

        self.tasks.apply(Some(&task.id), transition.created_tasks).await;
        let ended = staged.ended;
        let view = staged.view();
        *guard = staged;

        if ended {
            self.instances.write().await.remove(&view.id);
        }
        drop(guard);

        Ok(view)
    }

    /// Live view if running, otherwise the history projection
    pub async fn get_instance(&self, instance_id: &str) -> EngineResult<ProcessInstanceView> {
        if let Some(handle) = self.live_instance(instance_id).await {
            return Ok(handle.lock().await.view());
        }
        self.history.query_by_instance(instance_id).await
    }

    pub async fn instance_variables(&self, instance_id: &str) -> EngineResult<Variables> {
        Ok(self.get_instance(instance_id).await?.variables)
    }

    /// History events of an instance in insertion order
    pub async fn instance_history(&self, instance_id: &str) -> EngineResult<Vec<HistoryEvent>> {
        let events = self.history.events_for_instance(instance_id).await?;
        if events.is_empty() {
            return Err(EngineError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(events)
    }

    pub async fn suspend_instance(&self, instance_id: &str) -> EngineResult<ProcessInstanceView> {
        self.set_suspended(instance_id, true).await
    }

    pub async fn activate_instance(&self, instance_id: &str) -> EngineResult<ProcessInstanceView> {
        self.set_suspended(instance_id, false).await
    }

    async fn set_suspended(&self, instance_id: &str, suspended: bool) -> EngineResult<ProcessInstanceView> {
        let Some(handle) = self.live_instance(instance_id).await else {
            // Ended instances only live in history
            let view = self.history.query_by_instance(instance_id).await?;
            if !view.ended {
                return Err(EngineError::InstanceNotFound(instance_id.to_string()));
            }
            return Err(EngineError::Validation(format!(
                "process instance {} has already ended",
                view.id
            )));
        };

        let mut guard = handle.lock().await;
        if guard.ended {
            return Err(EngineError::Validation(format!(
                "process instance {} has already ended",
                guard.id
            )));
        }
        if guard.suspended == suspended {
            return Ok(guard.view());
        }

        let event_type = if suspended {
            HistoryEventType::Suspended
        } else {
            HistoryEventType::Activated
        };
        let mut staged = guard.clone();
        staged.suspended = suspended;
        self.history
            .record(
                vec![HistoryEvent::new(instance_id, event_type, json!({}))],
                Some(InstanceSnapshot {
                    instance: &staged,
                    removed_task: None,
                    created_tasks: &[],
                }),
            )
            .await?;

        *guard = staged;
        tracing::info!("⏯️ Instance {} {}", instance_id, event_type);
        Ok(guard.view())
    }

    /// Outstanding tasks assigned to `user_id`, newest first
    pub async fn list_tasks(&self, user_id: &str) -> Vec<Task> {
        self.tasks.list_by_assignee(user_id).await
    }

    /// Union of the parked positions of every live instance of a definition
    pub async fn active_node_ids(&self, definition_id: &str) -> Vec<String> {
        let handles: Vec<InstanceHandle> = self.instances.read().await.values().cloned().collect();

        let mut active = BTreeSet::new();
        for handle in handles {
            let instance = handle.lock().await;
            if instance.definition_id == definition_id {
                active.extend(instance.current_node_ids.iter().cloned());
            }
        }
        active.into_iter().collect()
    }

    pub async fn live_instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    fn advance<'a>(&'a self, graph: &'a ProcessGraph) -> Advance<'a> {
        Advance::new(graph, &self.delegates, self.config.max_advance_steps)
            .with_expression_limits(self.config.expression_limits())
    }

    async fn live_instance(&self, instance_id: &str) -> Option<InstanceHandle> {
        self.instances.read().await.get(instance_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::delegate::{Delegate, DelegateExecution};
    use crate::storage::ProcessStorage;

    const APPROVAL: &str = r#"{
        "key": "leave",
        "name": "Leave request",
        "nodes": [
            {"id": "start", "type": "startEvent"},
            {"id": "approve", "type": "userTask", "name": "Manager approval", "assignee": "${manager}"},
            {"id": "decide", "type": "exclusiveGateway", "defaultFlow": "toReject"},
            {"id": "ok", "type": "serviceTask", "delegate": "approvalSuccessDelegate"},
            {"id": "reject", "type": "serviceTask", "delegate": "approvalRejectDelegate"},
            {"id": "end", "type": "endEvent"}
        ],
        "flows": [
            {"id": "f1", "source": "start", "target": "approve"},
            {"id": "f2", "source": "approve", "target": "decide"},
            {"id": "toOk", "source": "decide", "target": "ok", "condition": "${approved == true}"},
            {"id": "toReject", "source": "decide", "target": "reject"},
            {"id": "f3", "source": "ok", "target": "end"},
            {"id": "f4", "source": "reject", "target": "end"}
        ]
    }"#;

    const TWO_STEP: &str = r#"{
        "key": "twoStep",
        "nodes": [
            {"id": "start", "type": "startEvent"},
            {"id": "first", "type": "userTask", "assignee": "bob"},
            {"id": "second", "type": "userTask", "assignee": "carol"},
            {"id": "end", "type": "endEvent"}
        ],
        "flows": [
            {"id": "f1", "source": "start", "target": "first"},
            {"id": "f2", "source": "first", "target": "second"},
            {"id": "f3", "source": "second", "target": "end"}
        ]
    }"#;

    async fn engine_with(delegates: DelegateRegistry, resources: &[&str]) -> ProcessEngine {
        let storage = ProcessStorage::in_memory().await.unwrap();
        let definitions = Arc::new(DefinitionRegistry::new(storage.clone()));
        for resource in resources {
            definitions.deploy("test.json", resource.as_bytes()).await.unwrap();
        }
        ProcessEngine::new(definitions, delegates, storage, EngineConfig::default())
    }

    /// Fresh registry and engine over an existing database, as after a restart
    async fn reopen(storage: &ProcessStorage) -> ProcessEngine {
        let definitions = Arc::new(DefinitionRegistry::new(storage.clone()));
        definitions.init_from_storage().await.unwrap();
        let engine = ProcessEngine::new(
            definitions,
            DelegateRegistry::with_builtin(),
            storage.clone(),
            EngineConfig::default(),
        );
        engine.init_from_storage().await.unwrap();
        engine
    }

    async fn engine() -> ProcessEngine {
        engine_with(DelegateRegistry::with_builtin(), &[APPROVAL, TWO_STEP]).await
    }

    fn start_leave(manager: &str) -> StartProcessRequest {
        let mut request = StartProcessRequest::new("leave", "alice");
        request.business_key = Some("LEAVE-1".to_string());
        request.variables.insert("manager".to_string(), json!(manager));
        request.variables.insert("days".to_string(), json!(3));
        request
    }

    #[tokio::test]
    async fn start_parks_on_user_task() {
        let engine = engine().await;
        let view = engine.start(start_leave("bob")).await.unwrap();

        assert!(!view.ended);
        assert_eq!(view.current_node_ids, vec!["approve".to_string()]);
        assert_eq!(view.variables["startUserId"], "alice");
        assert_eq!(view.process_definition_key, "leave");

        let tasks = engine.list_tasks("bob").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].process_instance_id, view.id);
        assert_eq!(tasks[0].node_id, "approve");
        assert_eq!(tasks[0].priority, 50);
    }

    #[tokio::test]
    async fn approving_ends_the_instance_with_final_result() {
        let engine = engine().await;
        let view = engine.start(start_leave("bob")).await.unwrap();
        let task = engine.list_tasks("bob").await.remove(0);

        let mut request = CompleteTaskRequest::new(&task.id, "bob");
        request.approved = Some(true);
        request.comment = Some("enjoy".to_string());
        let done = engine.complete(request).await.unwrap();

        assert!(done.ended);
        assert!(done.current_node_ids.is_empty());
        assert_eq!(done.variables["finalResult"], "approved");
        assert_eq!(done.variables["days"], 3);
        assert!(engine.list_tasks("bob").await.is_empty());
        assert_eq!(engine.live_instance_count().await, 0);

        // ended instances are served from history
        let stored = engine.get_instance(&view.id).await.unwrap();
        assert!(stored.ended);
        assert!(stored.current_node_ids.is_empty());
        assert_eq!(stored.variables["finalResult"], "approved");
        assert_eq!(stored.business_key.as_deref(), Some("LEAVE-1"));

        let kinds: Vec<_> = engine
            .instance_history(&view.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                HistoryEventType::Started,
                HistoryEventType::TaskCreated,
                HistoryEventType::TaskCompleted,
                HistoryEventType::Ended
            ]
        );
    }

    #[tokio::test]
    async fn rejecting_takes_the_default_flow() {
        let engine = engine().await;
        engine.start(start_leave("bob")).await.unwrap();
        let task = engine.list_tasks("bob").await.remove(0);

        let mut request = CompleteTaskRequest::new(&task.id, "bob");
        request.approved = Some(false);
        let done = engine.complete(request).await.unwrap();

        assert_eq!(done.variables["finalResult"], "rejected");
        assert!(done.variables["rejectTime"].is_i64());
    }

    #[tokio::test]
    async fn completion_merges_variables() {
        let engine = engine().await;
        let mut start = StartProcessRequest::new("twoStep", "alice");
        start.variables.insert("keep".to_string(), json!("me"));
        start.variables.insert("score".to_string(), json!(1));
        let view = engine.start(start).await.unwrap();

        let task = engine.list_tasks("bob").await.remove(0);
        let mut request = CompleteTaskRequest::new(&task.id, "bob");
        request.variables.insert("score".to_string(), json!(2));
        request.variables.insert("note".to_string(), json!("ok"));
        let after = engine.complete(request).await.unwrap();

        assert_eq!(after.current_node_ids, vec!["second".to_string()]);
        assert_eq!(after.variables["keep"], "me");
        assert_eq!(after.variables["score"], 2);
        assert_eq!(after.variables["note"], "ok");
        assert_eq!(engine.instance_variables(&view.id).await.unwrap(), after.variables);
    }

    #[tokio::test]
    async fn double_completion_is_task_not_found() {
        let engine = Arc::new(engine().await);
        let view = engine.start(StartProcessRequest::new("twoStep", "alice")).await.unwrap();
        let task = engine.list_tasks("bob").await.remove(0);

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let request = CompleteTaskRequest::new(&task.id, "bob");
                tokio::spawn(async move { engine.complete(request).await })
            })
            .collect();

        let mut ok = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, EngineError::TaskNotFound(_))),
            }
        }
        assert_eq!(ok, 1);

        let current = engine.get_instance(&view.id).await.unwrap();
        assert_eq!(current.current_node_ids, vec!["second".to_string()]);
        assert_eq!(engine.list_tasks("carol").await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_instances_keep_their_own_variables() {
        let engine = Arc::new(engine().await);

        let mut ids = Vec::new();
        for n in 0..10 {
            let mut request = StartProcessRequest::new("twoStep", format!("user-{}", n));
            request.variables.insert("n".to_string(), json!(n));
            ids.push(engine.start(request).await.unwrap().id);
        }

        let tasks = engine.list_tasks("bob").await;
        assert_eq!(tasks.len(), 10);

        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let n = task.variables["n"].clone();
                    let mut request = CompleteTaskRequest::new(&task.id, "bob");
                    request.variables.insert("echo".to_string(), n);
                    engine.complete(request).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for (n, id) in ids.iter().enumerate() {
            let view = engine.get_instance(id).await.unwrap();
            assert_eq!(view.variables["n"], json!(n));
            assert_eq!(view.variables["echo"], json!(n));
            assert_eq!(view.start_user_id, format!("user-{}", n));
        }
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_behind() {
        let dead_end = r#"{
            "key": "deadEnd",
            "nodes": [
                {"id": "start", "type": "startEvent"},
                {"id": "gw", "type": "exclusiveGateway"},
                {"id": "task", "type": "userTask", "assignee": "bob"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "gw"},
                {"id": "f2", "source": "gw", "target": "task", "condition": "${go == true}"},
                {"id": "f3", "source": "task", "target": "end"}
            ]
        }"#;
        let engine = engine_with(DelegateRegistry::new(), &[dead_end]).await;

        let mut request = StartProcessRequest::new("deadEnd", "alice");
        request.variables.insert("go".to_string(), json!(false));
        let err = engine.start(request).await.unwrap_err();

        assert!(matches!(err, EngineError::NoMatchingFlow { node_id } if node_id == "gw"));
        assert_eq!(engine.live_instance_count().await, 0);
        assert!(engine.tasks().is_empty().await);
    }

    #[tokio::test]
    async fn failed_completion_rolls_back() {
        struct Broken;
        impl Delegate for Broken {
            fn execute(&self, _: &DelegateExecution<'_>) -> anyhow::Result<Variables> {
                anyhow::bail!("downstream unavailable")
            }
        }

        let process = r#"{
            "key": "fragile",
            "nodes": [
                {"id": "start", "type": "startEvent"},
                {"id": "review", "type": "userTask", "assignee": "bob"},
                {"id": "book", "type": "serviceTask", "delegate": "broken"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "review"},
                {"id": "f2", "source": "review", "target": "book"},
                {"id": "f3", "source": "book", "target": "end"}
            ]
        }"#;
        let engine = engine_with(DelegateRegistry::new().register("broken", Broken), &[process]).await;
        let view = engine.start(StartProcessRequest::new("fragile", "alice")).await.unwrap();
        let task = engine.list_tasks("bob").await.remove(0);

        let mut request = CompleteTaskRequest::new(&task.id, "bob");
        request.variables.insert("touched".to_string(), json!(true));
        let err = engine.complete(request).await.unwrap_err();
        assert!(matches!(err, EngineError::DelegateFailed { .. }));

        let after = engine.get_instance(&view.id).await.unwrap();
        assert_eq!(after, view);
        assert!(engine.tasks().get(&task.id).await.is_some());
        assert_eq!(engine.instance_history(&view.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn suspended_instances_reject_completion() {
        let engine = engine().await;
        let view = engine.start(start_leave("bob")).await.unwrap();
        let task = engine.list_tasks("bob").await.remove(0);

        assert!(engine.suspend_instance(&view.id).await.unwrap().suspended);
        let err = engine
            .complete(CompleteTaskRequest::new(&task.id, "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceSuspended(_)));

        assert!(!engine.activate_instance(&view.id).await.unwrap().suspended);
        let mut request = CompleteTaskRequest::new(&task.id, "bob");
        request.approved = Some(true);
        assert!(engine.complete(request).await.unwrap().ended);

        let err = engine.suspend_instance(&view.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let engine = engine().await;

        let err = engine.start(StartProcessRequest::new("nope", "alice")).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));

        let err = engine
            .complete(CompleteTaskRequest::new("missing", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));

        let err = engine.get_instance("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound(_)));

        let err = engine.suspend_instance("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn active_node_ids_cover_live_instances() {
        let engine = engine().await;
        let first = engine.start(StartProcessRequest::new("twoStep", "alice")).await.unwrap();
        engine.start(StartProcessRequest::new("twoStep", "dave")).await.unwrap();

        let task = engine
            .list_tasks("bob")
            .await
            .into_iter()
            .find(|t| t.process_instance_id == first.id)
            .unwrap();
        engine.complete(CompleteTaskRequest::new(&task.id, "bob")).await.unwrap();

        let active = engine.active_node_ids(&first.process_definition_id).await;
        assert_eq!(active, vec!["first".to_string(), "second".to_string()]);
        assert!(engine.active_node_ids("other:1:x").await.is_empty());
    }

    #[tokio::test]
    async fn every_view_has_positions_iff_running() {
        let engine = engine().await;
        let view = engine.start(start_leave("bob")).await.unwrap();
        assert_eq!(view.current_node_ids.is_empty(), view.ended);

        let task = engine.list_tasks("bob").await.remove(0);
        let done = engine.complete(CompleteTaskRequest::new(&task.id, "bob")).await.unwrap();
        assert_eq!(done.current_node_ids.is_empty(), done.ended);

        let stored = engine.get_instance(&view.id).await.unwrap();
        assert_eq!(stored.current_node_ids.is_empty(), stored.ended);
    }

    #[tokio::test]
    async fn running_instances_survive_a_restart() {
        let storage = ProcessStorage::in_memory().await.unwrap();
        let first_run = reopen(&storage).await;
        first_run.definitions().deploy("leave.json", APPROVAL.as_bytes()).await.unwrap();
        first_run.definitions().deploy("two.json", TWO_STEP.as_bytes()).await.unwrap();

        let leave = first_run.start(start_leave("bob")).await.unwrap();
        let two = first_run.start(StartProcessRequest::new("twoStep", "alice")).await.unwrap();
        first_run.suspend_instance(&two.id).await.unwrap();
        drop(first_run);

        let engine = reopen(&storage).await;
        assert_eq!(engine.live_instance_count().await, 2);

        let restored = engine.get_instance(&leave.id).await.unwrap();
        assert_eq!(restored, leave);
        assert!(engine.get_instance(&two.id).await.unwrap().suspended);

        let tasks = engine.list_tasks("bob").await;
        assert_eq!(tasks.len(), 2);
        let leave_task = tasks
            .iter()
            .find(|t| t.process_instance_id == leave.id)
            .unwrap();
        let two_task = tasks
            .iter()
            .find(|t| t.process_instance_id == two.id)
            .unwrap();

        let err = engine
            .complete(CompleteTaskRequest::new(&two_task.id, "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceSuspended(_)));
        assert!(!engine.activate_instance(&two.id).await.unwrap().suspended);

        let mut request = CompleteTaskRequest::new(&leave_task.id, "bob");
        request.approved = Some(true);
        let done = engine.complete(request).await.unwrap();
        assert!(done.ended);
        assert_eq!(done.variables["finalResult"], "approved");

        let engine = reopen(&storage).await;
        assert_eq!(engine.live_instance_count().await, 1);
        assert!(engine.get_instance(&leave.id).await.unwrap().ended);
        assert!(!engine.get_instance(&two.id).await.unwrap().suspended);
        assert_eq!(engine.list_tasks("bob").await.len(), 1);
    }

    #[tokio::test]
    async fn failed_start_persists_no_state() {
        let storage = ProcessStorage::in_memory().await.unwrap();
        let engine = reopen(&storage).await;
        engine
            .definitions()
            .deploy(
                "broken.json",
                br#"{
                    "key": "broken",
                    "nodes": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "t", "type": "userTask", "assignee": "${(function() while true do end end)()}"},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "source": "start", "target": "t"},
                        {"id": "f2", "source": "t", "target": "end"}
                    ]
                }"#,
            )
            .await
            .unwrap();

        let err = engine
            .start(StartProcessRequest::new("broken", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExpressionError { .. }));
        assert!(storage.load_running_instances().await.unwrap().is_empty());
        assert!(storage.load_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_due_dates_are_rejected_at_deploy() {
        let engine = engine().await;
        let err = engine
            .definitions()
            .deploy(
                "late.json",
                br#"{
                    "key": "late",
                    "nodes": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "t", "type": "userTask", "assignee": "bob", "dueInHours": 9000000000},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "source": "start", "target": "t"},
                        {"id": "f2", "source": "t", "target": "end"}
                    ]
                }"#,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));

        let err = engine
            .start(StartProcessRequest::new("late", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));
    }
}
