/// Token traversal over a process graph
///
/// Moves a staged instance forward until every branch is either parked on a
/// user task or consumed by an end event. Runs synchronously: conditions and
/// delegates are evaluated inline and nothing here touches shared state. The
/// caller decides whether to commit the staged instance and the collected
/// effects.

use crate::error::{EngineError, EngineResult};
use crate::process::graph::ProcessGraph;
use crate::process::types::{Node, NodeKind};
use crate::runtime::delegate::{DelegateExecution, DelegateRegistry};
use crate::runtime::expression::{self, ExpressionLimits};
use crate::runtime::history::{HistoryEvent, HistoryEventType};
use crate::runtime::tasks::Task;
use crate::runtime::types::ProcessInstance;
use chrono::{TimeDelta, Utc};
use serde_json::json;
use std::collections::VecDeque;

/// Side effects produced by one traversal
#[derive(Debug, Default)]
pub(crate) struct Transition {
    pub created_tasks: Vec<Task>,
    pub events: Vec<HistoryEvent>,
}

/// Where the traversal starts
#[derive(Debug, Clone, Copy)]
pub(crate) enum Entry<'a> {
    /// Enter the start event of a fresh instance
    Start,
    /// Leave a completed user task
    Leave(&'a str),
}

/// Graph walker bound to one definition
pub(crate) struct Advance<'a> {
    graph: &'a ProcessGraph,
    delegates: &'a DelegateRegistry,
    max_steps: usize,
    limits: ExpressionLimits,
}

impl<'a> Advance<'a> {
    pub fn new(graph: &'a ProcessGraph, delegates: &'a DelegateRegistry, max_steps: usize) -> Self {
        Self {
            graph,
            delegates,
            max_steps,
            limits: ExpressionLimits::default(),
        }
    }

    pub fn with_expression_limits(mut self, limits: ExpressionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Advance `instance` in place from `entry`
    pub fn run(&self, instance: &mut ProcessInstance, entry: Entry<'_>) -> EngineResult<Transition> {
        let mut transition = Transition::default();
        let mut worklist: VecDeque<String> = VecDeque::new();

        match entry {
            Entry::Start => worklist.push_back(self.graph.start_node().id.clone()),
            Entry::Leave(node_id) => {
                let node = self.node(node_id)?;
                worklist.extend(self.follow(node, instance)?);
            }
        }

        let mut steps = 0usize;
        while let Some(node_id) = worklist.pop_front() {
            steps += 1;
            if steps > self.max_steps {
                tracing::error!(
                    "🔁 Instance {} exceeded {} steps, aborting traversal",
                    instance.id,
                    self.max_steps
                );
                return Err(EngineError::InfiniteLoopDetected {
                    limit: self.max_steps,
                });
            }

            let node = self.node(&node_id)?;
            tracing::debug!(
                "📍 Instance {} entering {} '{}'",
                instance.id,
                node.kind.label(),
                node.id
            );

            match &node.kind {
                NodeKind::StartEvent => worklist.extend(self.follow(node, instance)?),
                NodeKind::UserTask { .. } => {
                    let task = self.create_task(node, instance)?;
                    instance.current_node_ids.push(node.id.clone());
                    transition.events.push(HistoryEvent::new(
                        &instance.id,
                        HistoryEventType::TaskCreated,
                        json!({
                            "taskId": task.id,
                            "nodeId": node.id,
                            "name": task.name,
                            "assignee": task.assignee,
                            "variables": instance.variables,
                        }),
                    ));
                    transition.created_tasks.push(task);
                }
                NodeKind::ServiceTask { delegate } => {
                    let updates = self.delegates.invoke(
                        delegate,
                        &DelegateExecution {
                            instance_id: &instance.id,
                            business_key: instance.business_key.as_deref(),
                            node_id: &node.id,
                            variables: &instance.variables,
                        },
                    )?;
                    instance.variables.extend(updates);
                    worklist.extend(self.follow(node, instance)?);
                }
                NodeKind::ExclusiveGateway { default_flow } => {
                    let target = self.choose(node, default_flow.as_deref(), instance)?;
                    worklist.push_back(target);
                }
                NodeKind::EndEvent => {
                    tracing::debug!("🏁 Branch of instance {} reached '{}'", instance.id, node.id);
                }
            }
        }

        if instance.current_node_ids.is_empty() {
            let end_time = Utc::now();
            instance.ended = true;
            instance.end_time = Some(end_time);
            transition.events.push(
                HistoryEvent::new(
                    &instance.id,
                    HistoryEventType::Ended,
                    json!({ "variables": instance.variables }),
                )
                .at(end_time),
            );
            tracing::info!("🎉 Instance {} ended after {} steps", instance.id, steps);
        }

        Ok(transition)
    }

    fn node(&self, node_id: &str) -> EngineResult<&'a Node> {
        self.graph.node(node_id).ok_or_else(|| {
            EngineError::Validation(format!("node '{}' is not part of the definition", node_id))
        })
    }

    /// Targets of every outgoing flow whose condition is absent or true
    fn follow(&self, node: &Node, instance: &ProcessInstance) -> EngineResult<Vec<String>> {
        let mut targets = Vec::new();
        for flow in self.graph.outgoing(&node.id) {
            let taken = match &flow.condition {
                Some(condition) => self.condition_holds(condition, instance)?,
                None => true,
            };
            if taken {
                targets.push(flow.target.clone());
            }
        }

        if targets.is_empty() {
            return Err(EngineError::NoMatchingFlow {
                node_id: node.id.clone(),
            });
        }
        Ok(targets)
    }

    /// First true branch in declaration order, else the default flow
    fn choose(
        &self,
        node: &Node,
        default_flow: Option<&str>,
        instance: &ProcessInstance,
    ) -> EngineResult<String> {
        let outgoing = self.graph.outgoing(&node.id);

        for flow in &outgoing {
            if Some(flow.id.as_str()) == default_flow {
                continue;
            }
            let taken = match &flow.condition {
                Some(condition) => self.condition_holds(condition, instance)?,
                None => true,
            };
            if taken {
                tracing::debug!("🔀 Gateway '{}' took flow '{}'", node.id, flow.id);
                return Ok(flow.target.clone());
            }
        }

        outgoing
            .iter()
            .find(|flow| Some(flow.id.as_str()) == default_flow)
            .map(|flow| {
                tracing::debug!("🔀 Gateway '{}' took default flow '{}'", node.id, flow.id);
                flow.target.clone()
            })
            .ok_or_else(|| EngineError::NoMatchingFlow {
                node_id: node.id.clone(),
            })
    }

    fn condition_holds(&self, condition: &str, instance: &ProcessInstance) -> EngineResult<bool> {
        expression::evaluate_condition(condition, &instance.variables, &self.limits)
    }

    fn create_task(&self, node: &Node, instance: &ProcessInstance) -> EngineResult<Task> {
        let NodeKind::UserTask {
            assignee,
            priority,
            due_in_hours,
        } = &node.kind
        else {
            return Err(EngineError::Validation(format!(
                "node '{}' is not a user task",
                node.id
            )));
        };

        let assignee = match assignee {
            Some(expr) => expression::resolve_assignee(expr, &instance.variables, &self.limits)?,
            None => None,
        };
        let create_time = Utc::now();
        let due_date = match due_in_hours {
            Some(hours) => Some(
                TimeDelta::try_hours(*hours)
                    .and_then(|delta| create_time.checked_add_signed(delta))
                    .ok_or_else(|| {
                        EngineError::Validation(format!(
                            "due date of user task '{}' is out of range ({} hours)",
                            node.id, hours
                        ))
                    })?,
            ),
            None => None,
        };

        Ok(Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: node.name.clone(),
            process_instance_id: instance.id.clone(),
            process_definition_id: instance.definition_id.clone(),
            node_id: node.id.clone(),
            assignee,
            variables: instance.variables.clone(),
            create_time,
            due_date,
            priority: *priority,
        })
    }
}
