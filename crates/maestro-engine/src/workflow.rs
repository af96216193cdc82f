//! Declarative task workflows.
//!
//! A workflow is a list of tasks with explicit dependencies. It compiles into an acyclic
//! [`Graph`]: one node per task, one edge per dependency, and every task without dependencies
//! as an entry point. Task priority orders dispatch when the pool is full.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use maestro_core::config::GraphConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::traits::{Invocable, UnitContext};
use maestro_core::types::{Invocation, NodeId, UnitKind, UnitOutcome};

use crate::graph::{Graph, GraphBuilder};
use crate::node::NodeOptions;

/// One task of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: NodeId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(task_id: impl Into<NodeId>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            priority: 0,
            timeout_ms: None,
        }
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NodeId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A validated task list.
#[derive(Debug, Clone)]
pub struct Workflow {
    id: String,
    tasks: Vec<TaskSpec>,
    config: GraphConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl Workflow {
    /// Validate `tasks`: unique ids, known dependencies, no dependency cycle.
    pub fn new(id: impl Into<String>, tasks: Vec<TaskSpec>) -> Result<Self> {
        let id = id.into();
        if tasks.is_empty() {
            return Err(MaestroError::Validation(format!("workflow '{}' has no tasks", id)));
        }

        let mut known = HashSet::new();
        for task in &tasks {
            if !known.insert(&task.task_id) {
                return Err(MaestroError::Validation(format!(
                    "duplicate task id '{}'",
                    task.task_id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if dep == &task.task_id {
                    return Err(MaestroError::Validation(format!(
                        "task '{}' depends on itself",
                        task.task_id
                    )));
                }
                if !known.contains(dep) {
                    return Err(MaestroError::Validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.task_id, dep
                    )));
                }
            }
        }

        let workflow = Self {
            id,
            tasks,
            config: GraphConfig::default(),
            event_bus: None,
        };
        workflow.execution_order()?;
        Ok(workflow)
    }

    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Tasks grouped into levels: every task's dependencies sit in earlier levels. Within a
    /// level, higher priority comes first.
    pub fn execution_order(&self) -> Result<Vec<Vec<NodeId>>> {
        let mut remaining: HashMap<&NodeId, usize> = self
            .tasks
            .iter()
            .map(|t| (&t.task_id, t.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&NodeId, Vec<&TaskSpec>> = HashMap::new();
        for task in &self.tasks {
            for dep in &task.dependencies {
                dependents.entry(dep).or_default().push(task);
            }
        }

        let mut level: Vec<&TaskSpec> = self
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .collect();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !level.is_empty() {
            level.sort_by(|a, b| b.priority.cmp(&a.priority));
            placed += level.len();
            let mut next = Vec::new();
            for task in &level {
                for dependent in dependents.get(&task.task_id).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(&dependent.task_id) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            levels.push(level.iter().map(|t| t.task_id.clone()).collect());
            level = next;
        }

        if placed != self.tasks.len() {
            let stuck: Vec<String> = remaining
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(MaestroError::Validation(format!(
                "dependency cycle among tasks: {}",
                stuck.join(", ")
            )));
        }
        Ok(levels)
    }

    /// Compile into a graph, asking `factory` for the unit that performs each task.
    ///
    /// Tasks with a description receive `{"input": <run input>, "task": <description>}` as their
    /// task; tasks without one receive the run input unchanged.
    pub fn compile<F>(&self, factory: F) -> Result<Graph>
    where
        F: Fn(&TaskSpec) -> Arc<dyn Invocable>,
    {
        let mut builder = GraphBuilder::new()
            .with_name(self.id.clone())
            .with_config(self.config.clone());
        if let Some(bus) = &self.event_bus {
            builder = builder.with_event_bus(bus.clone());
        }

        for task in &self.tasks {
            let mut options = NodeOptions::default().with_priority(task.priority);
            options.timeout_ms = task.timeout_ms;
            if !task.description.is_empty() {
                options = options.with_description(task.description.clone());
            }
            let unit = factory(task);
            let unit: Arc<dyn Invocable> = if task.description.is_empty() {
                unit
            } else {
                Arc::new(TaskUnit {
                    description: task.description.clone(),
                    inner: unit,
                })
            };
            builder = builder.add_node_with(task.task_id.clone(), unit, options);
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                builder = builder.add_edge(dep.clone(), task.task_id.clone());
            }
            if task.dependencies.is_empty() {
                builder = builder.set_entry_point(task.task_id.clone());
            }
        }
        builder.build()
    }
}

/// Puts the task description in front of the unit.
struct TaskUnit {
    description: String,
    inner: Arc<dyn Invocable>,
}

impl Invocable for TaskUnit {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> UnitKind {
        self.inner.kind()
    }

    fn execute(&self, mut invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        invocation.task = json!({
            "input": invocation.task,
            "task": self.description,
        });
        self.inner.execute(invocation, ctx)
    }
}
