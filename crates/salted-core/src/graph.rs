//! Task Graph - validated DAG built from task descriptors
//!
//! Edges point from a task to each of its dependencies, weighted by the
//! dependency's declared position. Construction rejects duplicate ids,
//! dangling references and cycles before anything else runs.

use crate::descriptor::TaskDescriptor;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Structural graph errors; fatal to the whole build
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate task `{0}`")]
    DuplicateTask(String),

    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Immutable, acyclic task graph
#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<TaskDescriptor, usize>,
    index: HashMap<String, NodeIndex>,
    /// Per node: dependency indices in declared order
    deps: Vec<Vec<NodeIndex>>,
    /// Dependencies first
    order: Vec<NodeIndex>,
    /// Node -> position in `order`
    position: Vec<usize>,
}

impl TaskGraph {
    /// Index, link and validate descriptors
    pub fn build(descriptors: impl IntoIterator<Item = TaskDescriptor>) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for descriptor in descriptors {
            if index.contains_key(&descriptor.task_id) {
                return Err(GraphError::DuplicateTask(descriptor.task_id));
            }
            let task_id = descriptor.task_id.clone();
            let idx = graph.add_node(descriptor);
            index.insert(task_id, idx);
        }

        let mut deps = Vec::with_capacity(graph.node_count());
        for idx in graph.node_indices() {
            let task = &graph[idx];
            let mut resolved = Vec::with_capacity(task.dependencies.len());
            for dependency in &task.dependencies {
                match index.get(dependency) {
                    Some(&dep_idx) => resolved.push(dep_idx),
                    None => {
                        return Err(GraphError::UnknownDependency {
                            task: task.task_id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
            deps.push(resolved);
        }

        for (from, targets) in deps.iter().enumerate() {
            for (pos, &to) in targets.iter().enumerate() {
                graph.add_edge(NodeIndex::new(from), to, pos);
            }
        }

        let order = topological_order(&graph, &deps)?;
        let mut position = vec![0; order.len()];
        for (pos, idx) in order.iter().enumerate() {
            position[idx.index()] = pos;
        }

        tracing::debug!(
            "Task graph built: {} tasks, {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(Self {
            graph,
            index,
            deps,
            order,
            position,
        })
    }

    /// Descriptor for a task id
    pub fn get(&self, task_id: &str) -> Option<&TaskDescriptor> {
        self.index.get(task_id).map(|&idx| &self.graph[idx])
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    /// Descriptors with every dependency before its dependents
    pub fn topological_order(&self) -> impl Iterator<Item = &TaskDescriptor> + '_ {
        self.order.iter().map(move |&idx| &self.graph[idx])
    }

    /// Declared dependencies of a task
    pub fn dependencies(&self, task_id: &str) -> &[String] {
        self.get(task_id)
            .map(|task| task.dependencies.as_slice())
            .unwrap_or_default()
    }

    /// Distinct direct dependents, in topological order
    pub fn dependents(&self, task_id: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(task_id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        found.sort_by_key(|n| self.position[n.index()]);
        found.into_iter().map(|n| self.graph[n].task_id.as_str()).collect()
    }

    /// Every task that depends on `task_id` directly or transitively
    /// (excluding the task itself), in topological order
    pub fn affected(&self, task_id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(task_id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for dependent in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if seen.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        let mut found: Vec<NodeIndex> = seen.into_iter().collect();
        found.sort_by_key(|n| self.position[n.index()]);
        found.into_iter().map(|n| self.graph[n].task_id.as_str()).collect()
    }

    /// Tasks grouped by depth; a task's dependencies all sit in earlier levels
    pub fn levels(&self) -> Vec<Vec<&TaskDescriptor>> {
        self.level_indices()
            .into_iter()
            .map(|level| level.into_iter().map(|idx| &self.graph[idx]).collect())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub(crate) fn order_indices(&self) -> &[NodeIndex] {
        &self.order
    }

    pub(crate) fn descriptor(&self, idx: NodeIndex) -> &TaskDescriptor {
        &self.graph[idx]
    }

    pub(crate) fn dependency_indices(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.deps[idx.index()]
    }

    pub(crate) fn index_of(&self, task_id: &str) -> Option<NodeIndex> {
        self.index.get(task_id).copied()
    }

    /// Distinct direct dependents of a node
    pub(crate) fn dependent_indices(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut found: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        found.sort_by_key(|n| self.position[n.index()]);
        found
    }

    pub(crate) fn level_indices(&self) -> Vec<Vec<NodeIndex>> {
        let mut depth = vec![0usize; self.len()];
        let mut levels: Vec<Vec<NodeIndex>> = Vec::new();

        for &idx in &self.order {
            let d = self.deps[idx.index()]
                .iter()
                .map(|dep| depth[dep.index()] + 1)
                .max()
                .unwrap_or(0);
            depth[idx.index()] = d;
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(idx);
        }

        levels
    }
}

/// Three-colour DFS in input order, dependencies in declared order.
/// Post-order yields dependencies before dependents.
fn topological_order(
    graph: &DiGraph<TaskDescriptor, usize>,
    deps: &[Vec<NodeIndex>],
) -> Result<Vec<NodeIndex>, GraphError> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut order = Vec::with_capacity(graph.node_count());

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }

        marks[root.index()] = Mark::InProgress;
        let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let Some(&dep) = deps[node.index()].get(next) else {
                marks[node.index()] = Mark::Done;
                order.push(node);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            match marks[dep.index()] {
                Mark::Unvisited => {
                    marks[dep.index()] = Mark::InProgress;
                    stack.push((dep, 0));
                }
                Mark::InProgress => {
                    let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|(n, _)| graph[*n].task_id.clone())
                        .collect();
                    path.push(graph[dep].task_id.clone());
                    return Err(GraphError::Cycle { path });
                }
                Mark::Done => {}
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> TaskDescriptor {
        deps.iter()
            .fold(TaskDescriptor::new(id, "1.0"), |t, d| t.depends_on(*d))
    }

    fn ids<'a>(tasks: impl Iterator<Item = &'a TaskDescriptor>) -> Vec<&'a str> {
        tasks.map(|t| t.task_id.as_str()).collect()
    }

    #[test]
    fn test_build_order_dependencies_first() {
        let graph = TaskGraph::build(vec![
            task("top10", &["aggregate"]),
            task("aggregate", &["stream"]),
            task("stream", &[]),
        ])
        .unwrap();

        assert_eq!(ids(graph.topological_order()), vec!["stream", "aggregate", "top10"]);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_order_is_stable() {
        let tasks = vec![
            task("d", &["b", "c"]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("a", &[]),
            task("e", &[]),
        ];

        let first = TaskGraph::build(tasks.clone()).unwrap();
        let second = TaskGraph::build(tasks).unwrap();
        assert_eq!(ids(first.topological_order()), ids(second.topological_order()));
        assert_eq!(ids(first.topological_order()), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_duplicate_task() {
        let err = TaskGraph::build(vec![task("a", &[]), task("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask("a".into()));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = TaskGraph::build(vec![task("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_self_loop() {
        let err = TaskGraph::build(vec![task("a", &["a"])]).unwrap_err();
        assert_eq!(err, GraphError::Cycle { path: vec!["a".into(), "a".into()] });
    }

    #[test]
    fn test_longer_cycle_names_its_nodes() {
        let err = TaskGraph::build(vec![
            task("entry", &["a"]),
            task("a", &["b"]),
            task("b", &["c"]),
            task("c", &["a"]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> c -> a");
    }

    #[test]
    fn test_dependents_and_affected() {
        let graph = TaskGraph::build(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a", "a"]),
            task("d", &["b", "c"]),
            task("lonely", &[]),
        ])
        .unwrap();

        assert_eq!(graph.dependents("a"), vec!["b", "c"]);
        assert_eq!(graph.affected("a"), vec!["b", "c", "d"]);
        assert_eq!(graph.affected("b"), vec!["d"]);
        assert!(graph.affected("lonely").is_empty());
        assert!(graph.affected("missing").is_empty());
        assert_eq!(graph.dependencies("c"), ["a", "a"]);
    }

    #[test]
    fn test_levels() {
        let graph = TaskGraph::build(vec![
            task("d", &["b", "c"]),
            task("b", &["a"]),
            task("c", &[]),
            task("a", &[]),
        ])
        .unwrap();

        let levels: Vec<Vec<&str>> = graph
            .levels()
            .into_iter()
            .map(|level| ids(level.into_iter()))
            .collect();
        assert_eq!(levels, vec![vec!["a", "c"], vec!["b"], vec!["d"]]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.topological_order().count(), 0);
    }
}
