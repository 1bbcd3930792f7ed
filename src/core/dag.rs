//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the TaskDAG structure that represents task dependencies
//! as a directed acyclic graph, enabling parallel execution of independent
//! branches and joins where branches meet again.

use crate::core::task::{Task, TaskId, TaskState, TriggerRule};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
///
/// TaskDAG uses petgraph's DiGraph to represent task dependencies.
/// Nodes are tasks; an edge `a -> b` means `a` must reach a terminal state
/// (successfully, unless `b` is [`TriggerRule::AllDone`]) before `b` starts.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the DAG.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTask` if a task with the same name exists.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Add a dependency between two tasks.
    ///
    /// The dependency indicates that `upstream` must complete before
    /// `downstream` can start. Adding the same edge twice is a no-op.
    /// Cycles are reported by [`TaskDAG::validate`].
    ///
    /// # Errors
    /// Returns an error if either task is not found in the DAG.
    pub fn add_dependency(&mut self, upstream: &TaskId, downstream: &TaskId) -> Result<()> {
        let from_index = self.index_of(upstream)?;
        let to_index = self.index_of(downstream)?;

        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, ());
        }
        Ok(())
    }

    /// Add `upstream -> b -> c -> ...` edges for a linear chain of tasks.
    pub fn chain(&mut self, ids: &[&str]) -> Result<()> {
        for pair in ids.windows(2) {
            self.add_dependency(&TaskId::from(pair[0]), &TaskId::from(pair[1]))?;
        }
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a direct dependency exists between two tasks.
    pub fn has_dependency(&self, upstream: &TaskId, downstream: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(upstream), self.task_index.get(downstream))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Get the direct upstream tasks of the given task.
    pub fn upstream(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get the direct downstream tasks of the given task.
    pub fn downstream(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable from the given task (not including itself).
    pub fn descendants(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut reachable = HashSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return reachable;
        };

        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(index) = dfs.next(&self.graph) {
            if index != start {
                reachable.insert(self.graph[index].id.clone());
            }
        }
        reachable
    }

    /// Check whether `ancestor` reaches `id` through one or more edges.
    pub fn is_ancestor(&self, ancestor: &TaskId, id: &TaskId) -> bool {
        match (self.task_index.get(ancestor), self.task_index.get(id)) {
            (Some(&from), Some(&to)) if from != to => {
                has_path_connecting(&self.graph, from, to, None)
            }
            _ => false,
        }
    }

    /// Get all tasks in the DAG.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    // ========== Validation ==========

    /// Check that the graph is acyclic.
    ///
    /// # Errors
    /// Returns `Error::Cycle` naming a task on the offending cycle.
    pub fn validate(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }

    /// Check every template in every task.
    ///
    /// Each template must parse, and every task it references must exist and
    /// be a transitive upstream of the referencing task, so the value is
    /// guaranteed to be published before it is read.
    pub fn validate_references(&self) -> Result<()> {
        for task in self.graph.node_weights() {
            for template in task.kind.templates() {
                let references = template.references().map_err(|source| Error::Template {
                    task: task.id.clone(),
                    source,
                })?;

                for reference in references {
                    if !self.is_ancestor(&reference.task, &task.id) {
                        return Err(Error::InvalidReference {
                            task: task.id.clone(),
                            reference: reference.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ========== Scheduling Operations ==========

    /// Get all pending tasks that are ready to execute.
    ///
    /// A task is ready when it is still pending and its trigger rule holds:
    /// every upstream task succeeded ([`TriggerRule::AllSuccess`]) or every
    /// upstream task is terminal ([`TriggerRule::AllDone`]). Tasks with no
    /// dependencies are ready as soon as they are pending.
    ///
    /// # Arguments
    /// * `states` - Current state of each task; missing entries count as pending
    pub fn ready_tasks<'a>(&'a self, states: &HashMap<TaskId, TaskState>) -> Vec<&'a Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if !is_pending(states, &task.id) {
                    return None;
                }

                let mut upstream = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .map(|dep_index| state_of(states, &self.graph[dep_index].id));

                let satisfied = match task.trigger {
                    TriggerRule::AllSuccess => upstream.all(TaskState::is_success),
                    TriggerRule::AllDone => upstream.all(TaskState::is_terminal),
                };

                satisfied.then_some(task)
            })
            .collect()
    }

    /// Get pending tasks that can never run because an upstream task failed
    /// or was skipped, paired with that upstream task.
    pub fn blocked_tasks<'a>(
        &'a self,
        states: &HashMap<TaskId, TaskState>,
    ) -> Vec<(&'a Task, &'a TaskId)> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.trigger != TriggerRule::AllSuccess || !is_pending(states, &task.id) {
                    return None;
                }

                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .map(|dep_index| &self.graph[dep_index].id)
                    .find(|dep_id| {
                        matches!(
                            state_of(states, dep_id),
                            TaskState::Failed { .. } | TaskState::Skipped { .. }
                        )
                    })
                    .map(|culprit| (task, culprit))
            })
            .collect()
    }

    /// Check if every task in the DAG is terminal.
    pub fn all_terminal(&self, states: &HashMap<TaskId, TaskState>) -> bool {
        self.task_index
            .keys()
            .all(|id| state_of(states, id).is_terminal())
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns `Error::Cycle` if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::Cycle {
            task: self.graph[cycle.node_id()].id.clone(),
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Render the graph in Graphviz DOT format, nodes labelled with their
    /// kind.
    pub fn to_dot(&self, name: &str) -> String {
        let mut out = format!("digraph \"{}\" {{\n", name);
        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            out.push_str(&format!(
                "    \"{}\" [label=\"{}\\n({})\"];\n",
                task.id,
                task.id,
                task.kind.name()
            ));
        }
        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                out.push_str(&format!(
                    "    \"{}\" -> \"{}\";\n",
                    self.graph[from].id, self.graph[to].id
                ));
            }
        }
        out.push_str("}\n");
        out
    }
}

fn state_of<'a>(states: &'a HashMap<TaskId, TaskState>, id: &TaskId) -> &'a TaskState {
    static PENDING: TaskState = TaskState::Pending;
    states.get(id).unwrap_or(&PENDING)
}

fn is_pending(states: &HashMap<TaskId, TaskState>, id: &TaskId) -> bool {
    matches!(state_of(states, id), TaskState::Pending)
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
