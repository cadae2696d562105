//! Salted Core - Lineage-Versioned Task Graphs
//!
//! Features:
//! - BLAKE3 content hashes over a length-prefixed canonical encoding
//! - Any change to a task's version or parameters re-keys it and everything downstream
//! - petgraph-backed DAG with cycle detection and stable topological order
//! - Staleness detection against an external artifact store
//! - Parallel scheduler with failure isolation and per-key de-duplication

pub mod config;
pub mod descriptor;
pub mod encoder;
pub mod engine;
pub mod graph;
pub mod hasher;
pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod staleness;
pub mod store;
pub mod task;

pub use config::{default_config_path, load_config, save_config, BuildConfig, ConfigError, RetryPolicy};
pub use descriptor::{Param, ParamValue, TaskDescriptor};
pub use encoder::{encode, EncodingError};
pub use engine::{BuildError, Engine};
pub use graph::{GraphError, TaskGraph};
pub use hasher::{digest, hash_node, ContentHash, ParseHashError};
pub use report::{BuildReport, Failure, NodeReport, NodeState, Summary};
pub use resolver::{resolve, ResolveError, Resolution, VersionedNode};
pub use scheduler::{InFlight, Scheduler};
pub use staleness::{detect, Freshness, StaleReason, StalenessPlan, WorkItem};
pub use store::{ArtifactKey, ArtifactStore, FsStore, MemoryStore, SledStore, StoreError};
pub use task::{Input, Task, TaskContext, TaskLogic};
pub use tokio_util::sync::CancellationToken;
