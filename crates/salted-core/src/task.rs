//! Task registration surface - descriptor plus the logic that computes it

use crate::descriptor::{ParamValue, TaskDescriptor};
use crate::hasher::ContentHash;
use std::fmt;
use std::sync::Arc;

/// One upstream payload handed to a task
#[derive(Debug, Clone)]
pub struct Input {
    pub task_id: String,
    pub content_hash: ContentHash,
    pub payload: Arc<Vec<u8>>,
}

/// What a task sees while it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub descriptor: TaskDescriptor,
    pub content_hash: ContentHash,
    /// Declared dependency order
    pub inputs: Vec<Input>,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.descriptor.task_id
    }

    /// Payload of the `i`-th declared dependency
    pub fn input(&self, i: usize) -> Option<&[u8]> {
        self.inputs.get(i).map(|input| input.payload.as_slice())
    }

    /// Payload of the first dependency with this id
    pub fn input_by_id(&self, task_id: &str) -> Option<&[u8]> {
        self.inputs
            .iter()
            .find(|input| input.task_id == task_id)
            .map(|input| input.payload.as_slice())
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.descriptor.get_param(name)
    }
}

/// Caller-supplied computation; runs on a blocking thread
pub trait TaskLogic: Send + Sync {
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Vec<u8>>;
}

impl<F> TaskLogic for F
where
    F: Fn(&TaskContext) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Vec<u8>> {
        self(ctx)
    }
}

/// A descriptor with its logic attached
#[derive(Clone)]
pub struct Task {
    pub descriptor: TaskDescriptor,
    pub logic: Arc<dyn TaskLogic>,
}

impl Task {
    pub fn new<L>(descriptor: TaskDescriptor, logic: L) -> Self
    where
        L: TaskLogic + 'static,
    {
        Self {
            descriptor,
            logic: Arc::new(logic),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.task_id
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
