//! Version Resolver - content hashes for every node, dependencies first
//!
//! Nodes of one depth level never depend on each other, so each level is
//! hashed in parallel with Rayon once the previous levels are done.
//!
//! A node that cannot be encoded fails alone: it gets no hash, and neither
//! does anything downstream of it. Every other node resolves as usual.

use crate::encoder::EncodingError;
use crate::graph::TaskGraph;
use crate::hasher::{hash_node, ContentHash};
use petgraph::graph::NodeIndex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    /// A dependency had no hash yet; only reachable if the graph was not validated
    #[error("task `{task}` resolved before its dependency `{dependency}`")]
    MissingDependency { task: String, dependency: String },
}

/// A task id paired with its resolved content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedNode {
    pub task_id: String,
    pub content_hash: ContentHash,
}

/// Resolved hashes for one graph
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Topological order
    nodes: Vec<VersionedNode>,
    by_id: HashMap<String, usize>,
    /// Nodes whose own fields could not be encoded, topological order
    failed: Vec<(String, EncodingError)>,
    /// Nodes left without a hash because something upstream failed
    unresolved: HashSet<String>,
}

impl Resolution {
    pub fn hash(&self, task_id: &str) -> Option<ContentHash> {
        self.node(task_id).map(|n| n.content_hash)
    }

    pub fn node(&self, task_id: &str) -> Option<&VersionedNode> {
        self.by_id.get(task_id).map(|&i| &self.nodes[i])
    }

    /// Resolved nodes in topological order
    pub fn iter(&self) -> impl Iterator<Item = &VersionedNode> {
        self.nodes.iter()
    }

    /// Encoding failures, topological order
    pub fn failed(&self) -> impl Iterator<Item = (&str, &EncodingError)> {
        self.failed.iter().map(|(id, e)| (id.as_str(), e))
    }

    pub fn error(&self, task_id: &str) -> Option<&EncodingError> {
        self.failed.iter().find(|(id, _)| id == task_id).map(|(_, e)| e)
    }

    /// No hash because an upstream node failed to encode
    pub fn is_unresolved(&self, task_id: &str) -> bool {
        self.unresolved.contains(task_id)
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Resolved node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

enum NodeHash {
    Resolved(ContentHash),
    Failed(EncodingError),
    /// An upstream node has no hash
    Unresolved,
}

/// Resolve every node's content hash exactly once
pub fn resolve(graph: &TaskGraph) -> Result<Resolution, ResolveError> {
    let mut hashes: HashMap<NodeIndex, ContentHash> = HashMap::with_capacity(graph.len());
    let mut failed: HashMap<NodeIndex, EncodingError> = HashMap::new();
    let mut unresolved: HashSet<NodeIndex> = HashSet::new();

    for level in graph.level_indices() {
        let outcomes: Vec<(NodeIndex, NodeHash)> = level
            .par_iter()
            .map(|&idx| resolve_node(graph, &hashes, &failed, &unresolved, idx).map(|h| (idx, h)))
            .collect::<Result<_, _>>()?;

        for (idx, outcome) in outcomes {
            match outcome {
                NodeHash::Resolved(hash) => {
                    hashes.insert(idx, hash);
                }
                NodeHash::Failed(e) => {
                    tracing::warn!("{}", e);
                    failed.insert(idx, e);
                }
                NodeHash::Unresolved => {
                    unresolved.insert(idx);
                }
            }
        }
    }

    let mut resolution = Resolution {
        nodes: Vec::with_capacity(hashes.len()),
        by_id: HashMap::with_capacity(hashes.len()),
        failed: Vec::with_capacity(failed.len()),
        unresolved: HashSet::with_capacity(unresolved.len()),
    };
    for &idx in graph.order_indices() {
        let task_id = graph.descriptor(idx).task_id.clone();
        if let Some(&content_hash) = hashes.get(&idx) {
            resolution.by_id.insert(task_id.clone(), resolution.nodes.len());
            resolution.nodes.push(VersionedNode { task_id, content_hash });
        } else if let Some(e) = failed.remove(&idx) {
            resolution.failed.push((task_id, e));
        } else {
            resolution.unresolved.insert(task_id);
        }
    }

    tracing::debug!(
        "Resolved {} content hashes ({} failed, {} unresolved)",
        resolution.nodes.len(),
        resolution.failed.len(),
        resolution.unresolved.len()
    );
    Ok(resolution)
}

fn resolve_node(
    graph: &TaskGraph,
    hashes: &HashMap<NodeIndex, ContentHash>,
    failed: &HashMap<NodeIndex, EncodingError>,
    unresolved: &HashSet<NodeIndex>,
    idx: NodeIndex,
) -> Result<NodeHash, ResolveError> {
    let task = graph.descriptor(idx);
    let mut dependency_hashes = Vec::with_capacity(task.dependencies.len());
    for dep in graph.dependency_indices(idx) {
        match hashes.get(dep) {
            Some(&hash) => dependency_hashes.push(hash),
            None if failed.contains_key(dep) || unresolved.contains(dep) => {
                return Ok(NodeHash::Unresolved)
            }
            None => {
                return Err(ResolveError::MissingDependency {
                    task: task.task_id.clone(),
                    dependency: graph.descriptor(*dep).task_id.clone(),
                })
            }
        }
    }

    Ok(match hash_node(task, &dependency_hashes) {
        Ok(hash) => NodeHash::Resolved(hash),
        Err(e) => NodeHash::Failed(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TaskDescriptor;

    fn pipeline(aggregate_version: &str) -> Vec<TaskDescriptor> {
        vec![
            TaskDescriptor::new("stream", "1.0"),
            TaskDescriptor::new("aggregate", aggregate_version).depends_on("stream"),
            TaskDescriptor::new("top10", "1.0").depends_on("aggregate"),
            TaskDescriptor::new("digits", "1.0").param("c", 100.0),
        ]
    }

    fn hashes(tasks: Vec<TaskDescriptor>) -> Resolution {
        resolve(&TaskGraph::build(tasks).unwrap()).unwrap()
    }

    #[test]
    fn test_determinism() {
        let a = hashes(pipeline("1.0"));
        let b = hashes(pipeline("1.0"));

        assert_eq!(a.len(), 4);
        for node in a.iter() {
            assert_eq!(Some(node.content_hash), b.hash(&node.task_id));
        }
    }

    #[test]
    fn test_propagation() {
        let before = hashes(pipeline("1.0"));
        let after = hashes(pipeline("1.1"));

        assert_eq!(before.hash("stream"), after.hash("stream"));
        assert_ne!(before.hash("aggregate"), after.hash("aggregate"));
        assert_ne!(before.hash("top10"), after.hash("top10"));
        // Not reachable from aggregate
        assert_eq!(before.hash("digits"), after.hash("digits"));
    }

    #[test]
    fn test_param_change_propagates() {
        let base = vec![
            TaskDescriptor::new("train", "1.0").param("c", 100.0),
            TaskDescriptor::new("predict", "1.0").depends_on("train"),
        ];
        let mut tuned = base.clone();
        tuned[0] = TaskDescriptor::new("train", "1.0").param("c", 10.0);

        let a = hashes(base);
        let b = hashes(tuned);
        assert_ne!(a.hash("train"), b.hash("train"));
        assert_ne!(a.hash("predict"), b.hash("predict"));
    }

    #[test]
    fn test_dependency_order_sensitivity() {
        let build = |first: &str, second: &str| {
            hashes(vec![
                TaskDescriptor::new("left", "1.0"),
                TaskDescriptor::new("right", "2.0"),
                TaskDescriptor::new("join", "1.0")
                    .depends_on(first)
                    .depends_on(second),
            ])
        };

        let forward = build("left", "right");
        let swapped = build("right", "left");
        assert_eq!(forward.hash("left"), swapped.hash("left"));
        assert_ne!(forward.hash("join"), swapped.hash("join"));
    }

    #[test]
    fn test_hash_depends_on_lineage_not_dependency_name() {
        // Same upstream content under different ids gives the same downstream hash
        let a = hashes(vec![
            TaskDescriptor::new("source_a", "1.0"),
            TaskDescriptor::new("sink", "1.0").depends_on("source_a"),
        ]);
        let b = hashes(vec![
            TaskDescriptor::new("source_b", "1.0"),
            TaskDescriptor::new("sink", "1.0").depends_on("source_b"),
        ]);
        assert_eq!(a.hash("sink"), b.hash("sink"));
    }

    #[test]
    fn test_input_order_does_not_change_hashes() {
        let mut reversed = pipeline("1.0");
        reversed.reverse();

        let a = hashes(pipeline("1.0"));
        let b = hashes(reversed);
        for node in a.iter() {
            assert_eq!(Some(node.content_hash), b.hash(&node.task_id));
        }
    }

    #[test]
    fn test_encoding_failure_is_local() {
        let graph = TaskGraph::build(vec![
            TaskDescriptor::new("ok", "1"),
            TaskDescriptor::new("bad", "1").param("x", f64::NAN),
            TaskDescriptor::new("after_bad", "1").depends_on("bad"),
            TaskDescriptor::new("join", "1").depends_on("ok").depends_on("after_bad"),
        ])
        .unwrap();
        let resolution = resolve(&graph).unwrap();

        assert!(resolution.hash("ok").is_some());
        assert!(resolution.hash("bad").is_none());
        assert!(matches!(
            resolution.error("bad"),
            Some(EncodingError::NonFiniteFloat { param, .. }) if param == "x"
        ));
        assert!(resolution.is_unresolved("after_bad"));
        assert!(resolution.is_unresolved("join"));
        assert!(!resolution.is_unresolved("bad"));
        assert_eq!(resolution.len(), 1);
        assert!(!resolution.is_complete());
        assert_eq!(resolution.failed().map(|(id, _)| id).collect::<Vec<_>>(), vec!["bad"]);
    }

    #[test]
    fn test_wide_graph_resolves_in_parallel() {
        let mut tasks: Vec<_> = (0..200)
            .map(|i| TaskDescriptor::new(format!("leaf{}", i), "1.0").param("i", i))
            .collect();
        tasks.push(
            (0..200).fold(TaskDescriptor::new("root", "1.0"), |t, i| {
                t.depends_on(format!("leaf{}", i))
            }),
        );

        let resolution = hashes(tasks.clone());
        let again = hashes(tasks);
        assert_eq!(resolution.len(), 201);
        assert_eq!(resolution.hash("root"), again.hash("root"));
        assert_eq!(resolution.iter().last().map(|n| n.task_id.as_str()), Some("root"));
    }
}
