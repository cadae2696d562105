//! Staleness Detector - which nodes need (re)computation
//!
//! Walks the graph dependencies-first. A node whose upstream is already
//! stale is stale too, and the store is not asked about it. Everything
//! else is stale exactly when no artifact exists under its current hash.

use crate::config::RetryPolicy;
use crate::graph::TaskGraph;
use crate::hasher::ContentHash;
use crate::resolver::{Resolution, VersionedNode};
use crate::store::{with_retry, ArtifactKey, ArtifactStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a node must run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleReason {
    /// No artifact under the current hash
    Missing,
    /// An upstream node is being recomputed (or could not be checked)
    UpstreamStale { dependency: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Freshness {
    /// Artifact present; nothing to do
    Fresh,
    Stale(StaleReason),
    /// The existence check itself failed
    Unknown { error: String },
}

impl Freshness {
    /// Needs work (or cannot be trusted)
    pub fn needs_work(&self) -> bool {
        !matches!(self, Freshness::Fresh)
    }
}

/// A stale node with its input keys, in declared dependency order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub task_id: String,
    pub content_hash: ContentHash,
    pub inputs: Vec<ArtifactKey>,
}

impl WorkItem {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(self.task_id.clone(), self.content_hash)
    }
}

#[derive(Debug, Clone)]
struct PlanEntry {
    node: VersionedNode,
    inputs: Vec<ArtifactKey>,
    freshness: Freshness,
}

/// Freshness of every node, in topological order
#[derive(Debug, Clone)]
pub struct StalenessPlan {
    entries: Vec<PlanEntry>,
    by_id: HashMap<String, usize>,
    queried: usize,
}

impl StalenessPlan {
    pub fn status(&self, task_id: &str) -> Option<&Freshness> {
        self.by_id.get(task_id).map(|&i| &self.entries[i].freshness)
    }

    pub fn is_stale(&self, task_id: &str) -> bool {
        self.status(task_id).is_some_and(Freshness::needs_work)
    }

    /// Nodes that need work, topological order
    pub fn stale(&self) -> Vec<&VersionedNode> {
        self.entries
            .iter()
            .filter(|e| e.freshness.needs_work())
            .map(|e| &e.node)
            .collect()
    }

    /// Nodes with artifacts already in place
    pub fn fresh(&self) -> Vec<&VersionedNode> {
        self.entries
            .iter()
            .filter(|e| !e.freshness.needs_work())
            .map(|e| &e.node)
            .collect()
    }

    pub fn work_items(&self) -> Vec<WorkItem> {
        self.entries
            .iter()
            .filter(|e| e.freshness.needs_work())
            .map(|e| WorkItem {
                task_id: e.node.task_id.clone(),
                content_hash: e.node.content_hash,
                inputs: e.inputs.clone(),
            })
            .collect()
    }

    /// (node, freshness) in topological order
    pub fn iter(&self) -> impl Iterator<Item = (&VersionedNode, &Freshness)> {
        self.entries.iter().map(|e| (&e.node, &e.freshness))
    }

    /// Store lookups performed
    pub fn queried(&self) -> usize {
        self.queried
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classify every node; blocking (runs store calls inline)
pub fn detect(
    graph: &TaskGraph,
    resolution: &Resolution,
    store: &dyn ArtifactStore,
    retry: &RetryPolicy,
) -> StalenessPlan {
    let mut entries: Vec<PlanEntry> = Vec::with_capacity(resolution.len());
    let mut by_id: HashMap<String, usize> = HashMap::with_capacity(resolution.len());
    let mut queried = 0;

    for node in resolution.iter() {
        let dependencies = graph.dependencies(&node.task_id);

        let inputs: Vec<ArtifactKey> = dependencies
            .iter()
            .filter_map(|dep| resolution.hash(dep).map(|hash| ArtifactKey::new(dep.clone(), hash)))
            .collect();

        let stale_upstream = dependencies.iter().find(|dep| {
            by_id
                .get(dep.as_str())
                .map_or(true, |&i| entries[i].freshness.needs_work())
        });

        let freshness = match stale_upstream {
            Some(dependency) => Freshness::Stale(StaleReason::UpstreamStale {
                dependency: dependency.clone(),
            }),
            None => {
                queried += 1;
                let key = ArtifactKey::new(node.task_id.clone(), node.content_hash);
                match with_retry(retry, "exists", || store.exists(&key)) {
                    Ok(true) => Freshness::Fresh,
                    Ok(false) => Freshness::Stale(StaleReason::Missing),
                    Err(e) => {
                        tracing::warn!("Existence check failed for {}: {}", key, e);
                        Freshness::Unknown { error: e.to_string() }
                    }
                }
            }
        };

        tracing::debug!("{} [{}] -> {:?}", node.task_id, node.content_hash.short(8), freshness);
        by_id.insert(node.task_id.clone(), entries.len());
        entries.push(PlanEntry {
            node: node.clone(),
            inputs,
            freshness,
        });
    }

    StalenessPlan {
        entries,
        by_id,
        queried,
    }
}
