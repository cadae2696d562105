//! Build Report - terminal state of every node after a run

use crate::hasher::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node lifecycle
///
/// `Pending -> Skipped`, `Pending -> Running -> Completed | Failed`,
/// `Pending -> Blocked`. `Cancelled` marks nodes never dispatched because
/// the build was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Skipped,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Running)
    }

    /// Artifact available for dependents
    pub fn is_success(&self) -> bool {
        matches!(self, NodeState::Skipped | NodeState::Completed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Skipped => "skipped",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::Blocked => "blocked",
            NodeState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a node did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The node's own fields have no canonical encoding, so it has no hash
    Encoding { message: String },
    /// Task logic returned an error or panicked
    Execution { message: String },
    /// exists/read/commit failed after retries
    Store { message: String },
    /// Not attempted; `chain` runs from the failed root to this node's parent
    Blocked { root: String, chain: Vec<String> },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Encoding { message } => write!(f, "cannot hash: {}", message),
            Failure::Execution { message } => write!(f, "task failed: {}", message),
            Failure::Store { message } => write!(f, "store failed: {}", message),
            Failure::Blocked { chain, .. } => write!(f, "blocked by {}", chain.join(" -> ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub task_id: String,
    /// Absent when the node (or something upstream) could not be hashed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    pub state: NodeState,
    pub duration_ms: u64,
    /// Result came from a concurrent execution of the same key
    #[serde(default)]
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// Count per terminal state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} skipped, {} failed, {} blocked",
            self.completed, self.skipped, self.failed, self.blocked
        )?;
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    /// Topological order
    pub nodes: Vec<NodeReport>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl BuildReport {
    pub fn node(&self, task_id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.task_id == task_id)
    }

    pub fn state(&self, task_id: &str) -> Option<NodeState> {
        self.node(task_id).map(|n| n.state)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for node in &self.nodes {
            match node.state {
                NodeState::Skipped => summary.skipped += 1,
                NodeState::Completed => summary.completed += 1,
                NodeState::Failed => summary.failed += 1,
                NodeState::Blocked => summary.blocked += 1,
                NodeState::Cancelled | NodeState::Pending | NodeState::Running => {
                    summary.cancelled += 1
                }
            }
        }
        summary
    }

    /// Every node skipped or completed
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.nodes.iter().all(|n| n.state.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.state == NodeState::Failed)
    }

    pub fn blocked(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.state == NodeState::Blocked)
    }

    /// The failed node behind a failed or blocked node
    pub fn root_cause(&self, task_id: &str) -> Option<&str> {
        let node = self.node(task_id)?;
        match (&node.state, &node.failure) {
            (NodeState::Failed, _) => Some(node.task_id.as_str()),
            (NodeState::Blocked, Some(Failure::Blocked { root, .. })) => Some(root.as_str()),
            _ => None,
        }
    }
}
