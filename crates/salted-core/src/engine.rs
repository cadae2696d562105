//! Build Engine - graph, hashes, staleness, execution in one call

use crate::config::BuildConfig;
use crate::descriptor::TaskDescriptor;
use crate::graph::{GraphError, TaskGraph};
use crate::report::BuildReport;
use crate::resolver::{resolve, ResolveError, Resolution};
use crate::scheduler::{InFlight, Scheduler};
use crate::staleness::{detect, StalenessPlan};
use crate::store::ArtifactStore;
use crate::task::{Task, TaskLogic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that stop a build before any task runs
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("staleness check aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lineage-versioned build engine over one artifact store
pub struct Engine {
    store: Arc<dyn ArtifactStore>,
    config: BuildConfig,
    in_flight: Arc<InFlight>,
    /// Parent of every build's token; replaced by `reset_cancel`
    cancel: Mutex<CancellationToken>,
}

impl Engine {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            config: BuildConfig::default(),
            in_flight: Arc::new(InFlight::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Cancelling stops dispatch for every build of this engine, running or
    /// later, until `reset_cancel` is called
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Let later builds run again after a cancellation
    pub fn reset_cancel(&self) {
        let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    /// Content hashes only
    pub fn resolve(&self, descriptors: Vec<TaskDescriptor>) -> Result<(TaskGraph, Resolution), BuildError> {
        let graph = TaskGraph::build(descriptors)?;
        let resolution = resolve(&graph)?;
        Ok((graph, resolution))
    }

    /// Dry run: hashes and staleness, nothing executes
    pub async fn plan(
        &self,
        descriptors: Vec<TaskDescriptor>,
    ) -> Result<(Resolution, StalenessPlan), BuildError> {
        let (graph, resolution) = self.resolve(descriptors)?;
        let (_, resolution, plan) = self.detect(graph, resolution).await?;
        Ok((resolution, plan))
    }

    /// Build every stale task. Structural errors abort before execution; a
    /// node that cannot be hashed fails on its own and blocks its dependents.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<BuildReport, BuildError> {
        let start = Instant::now();

        let mut logic: HashMap<String, Arc<dyn TaskLogic>> = HashMap::with_capacity(tasks.len());
        let mut descriptors = Vec::with_capacity(tasks.len());
        for task in tasks {
            logic.entry(task.descriptor.task_id.clone()).or_insert(task.logic);
            descriptors.push(task.descriptor);
        }

        let (graph, resolution) = self.resolve(descriptors)?;
        let (graph, resolution, plan) = self.detect(graph, resolution).await?;
        tracing::info!(
            "{} tasks, {} stale ({} store lookups)",
            plan.len(),
            plan.stale().len(),
            plan.queried()
        );

        let scheduler = Scheduler::new(Arc::clone(&self.store), self.config.clone())
            .with_in_flight(Arc::clone(&self.in_flight))
            .with_cancel_token(self.cancel_token().child_token());
        let report = scheduler.run(&graph, &resolution, &plan, &logic).await;

        tracing::info!("Build finished in {:?}: {}", start.elapsed(), report.summary());
        Ok(report)
    }

    /// Store lookups block, so they run off the async runtime
    async fn detect(
        &self,
        graph: TaskGraph,
        resolution: Resolution,
    ) -> Result<(TaskGraph, Resolution, StalenessPlan), BuildError> {
        let store = Arc::clone(&self.store);
        let retry = self.config.retry.clone();
        let result = tokio::task::spawn_blocking(move || {
            let plan = detect(&graph, &resolution, store.as_ref(), &retry);
            (graph, resolution, plan)
        })
        .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::report::{Failure, NodeState};
    use crate::store::{ArtifactKey, MemoryStore, StoreError};
    use crate::task::TaskContext;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> BuildConfig {
        BuildConfig::default()
            .with_concurrency(4)
            .with_retry(RetryPolicy::none())
    }

    /// stream -> aggregate -> top10, each appending its id to its input
    fn pipeline(aggregate_version: &str, calls: &Arc<AtomicUsize>) -> Vec<Task> {
        let step = |id: &'static str, version: &str, dep: Option<&str>| {
            let calls = Arc::clone(calls);
            let descriptor = match dep {
                Some(dep) => TaskDescriptor::new(id, version).depends_on(dep),
                None => TaskDescriptor::new(id, version),
            };
            Task::new(descriptor, move |ctx: &TaskContext| -> anyhow::Result<Vec<u8>> {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut out = ctx.input(0).unwrap_or_default().to_vec();
                out.extend_from_slice(id.as_bytes());
                out.push(b';');
                Ok(out)
            })
        };

        vec![
            step("stream", "1.0", None),
            step("aggregate", aggregate_version, Some("stream")),
            step("top10", "1.0", Some("aggregate")),
        ]
    }

    #[tokio::test]
    async fn test_stream_aggregate_top10_scenario() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).with_config(config());
        let calls = Arc::new(AtomicUsize::new(0));

        // First run: everything computed
        let first = engine.run(pipeline("1.0", &calls)).await.unwrap();
        for id in ["stream", "aggregate", "top10"] {
            assert_eq!(first.state(id), Some(NodeState::Completed), "{}", id);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let top10 = first.node("top10").unwrap().content_hash.unwrap();
        let payload = store.read(&ArtifactKey::new("top10", top10)).unwrap();
        assert_eq!(payload, b"stream;aggregate;top10;");

        // Second run: idempotent
        let second = engine.run(pipeline("1.0", &calls)).await.unwrap();
        assert_eq!(second.summary().skipped, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(second.nodes, {
            let mut expected = first.nodes.clone();
            for node in &mut expected {
                node.state = NodeState::Skipped;
                node.duration_ms = 0;
            }
            expected
        });

        // Third run: aggregate bumped, top10 follows
        let third = engine.run(pipeline("1.1", &calls)).await.unwrap();
        assert_eq!(third.state("stream"), Some(NodeState::Skipped));
        assert_eq!(third.state("aggregate"), Some(NodeState::Completed));
        assert_eq!(third.state("top10"), Some(NodeState::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let hash = |report: &BuildReport, id: &str| report.node(id).unwrap().content_hash.unwrap();
        assert_eq!(hash(&first, "stream"), hash(&third, "stream"));
        assert_ne!(hash(&first, "aggregate"), hash(&third, "aggregate"));
        assert_ne!(hash(&first, "top10"), hash(&third, "top10"));

        // Both lineages stay addressable
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn test_structural_errors_run_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Engine::new(Arc::new(MemoryStore::new())).with_config(config());

        let mut tasks = pipeline("1.0", &calls);
        let counted = Arc::clone(&calls);
        tasks.push(Task::new(
            TaskDescriptor::new("loop", "1").depends_on("loop"),
            move |_: &TaskContext| -> anyhow::Result<Vec<u8>> {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            },
        ));

        let err = engine.run(tasks).await.unwrap_err();
        assert!(matches!(err, BuildError::Graph(GraphError::Cycle { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut dup = pipeline("1.0", &calls);
        dup.extend(pipeline("1.0", &calls));
        let err = engine.run(dup).await.unwrap_err();
        assert!(matches!(err, BuildError::Graph(GraphError::DuplicateTask(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unencodable_node_fails_alone() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).with_config(config());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = pipeline("1.0", &calls);
        tasks.push(Task::new(
            TaskDescriptor::new("svm", "1").param("gamma", f64::NAN),
            |_: &TaskContext| -> anyhow::Result<Vec<u8>> { Ok(b"model".to_vec()) },
        ));
        tasks.push(Task::new(
            TaskDescriptor::new("predict", "1").depends_on("svm"),
            |_: &TaskContext| -> anyhow::Result<Vec<u8>> { Ok(b"labels".to_vec()) },
        ));

        let report = engine.run(tasks).await.unwrap();
        for id in ["stream", "aggregate", "top10"] {
            assert_eq!(report.state(id), Some(NodeState::Completed), "{}", id);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(report.state("svm"), Some(NodeState::Failed));
        assert!(matches!(
            report.node("svm").unwrap().failure,
            Some(Failure::Encoding { .. })
        ));
        assert_eq!(report.state("predict"), Some(NodeState::Blocked));
        assert_eq!(report.root_cause("predict"), Some("svm"));
        assert!(report.node("predict").unwrap().content_hash.is_none());
        assert!(!report.is_success());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_isolation() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store).with_config(config());
        let ok = |id: &str, deps: &[&str]| {
            let descriptor = deps
                .iter()
                .fold(TaskDescriptor::new(id, "1"), |t, d| t.depends_on(*d));
            Task::new(descriptor, |_: &TaskContext| -> anyhow::Result<Vec<u8>> {
                Ok(b"ok".to_vec())
            })
        };

        let tasks = vec![
            ok("root", &[]),
            Task::new(
                TaskDescriptor::new("x", "1").depends_on("root"),
                |_: &TaskContext| -> anyhow::Result<Vec<u8>> { Err(anyhow!("bad input")) },
            ),
            ok("after_x", &["x"]),
            ok("diamond", &["after_x", "side"]),
            ok("side", &["root"]),
            ok("island", &[]),
        ];

        let report = engine.run(tasks).await.unwrap();
        assert_eq!(report.state("x"), Some(NodeState::Failed));
        assert_eq!(report.state("after_x"), Some(NodeState::Blocked));
        assert_eq!(report.state("diamond"), Some(NodeState::Blocked));
        for id in ["root", "side", "island"] {
            assert_eq!(report.state(id), Some(NodeState::Completed), "{}", id);
        }
        assert_eq!(
            report.node("diamond").unwrap().failure,
            Some(Failure::Blocked {
                root: "x".into(),
                chain: vec!["x".into(), "after_x".into()],
            })
        );
        assert!(!report.is_success());

        // The failure is retried next time; the rest is reused
        let again = engine
            .run(vec![ok("root", &[]), ok("island", &[]), ok("side", &["root"])])
            .await
            .unwrap();
        assert_eq!(again.summary().skipped, 3);
    }

    #[tokio::test]
    async fn test_plan_is_a_dry_run() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).with_config(config());
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptors: Vec<_> = pipeline("1.0", &calls)
            .into_iter()
            .map(|t| t.descriptor)
            .collect();

        let (resolution, plan) = engine.plan(descriptors.clone()).await.unwrap();
        assert_eq!(resolution.len(), 3);
        assert_eq!(plan.stale().len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.is_empty());

        engine.run(pipeline("1.0", &calls)).await.unwrap();
        let (_, plan) = engine.plan(descriptors).await.unwrap();
        assert!(plan.stale().is_empty());
    }

    /// Memory store that errors on chosen calls for one task id each
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        exists_fails: Option<&'static str>,
        read_fails: Option<&'static str>,
        commit_fails: Option<&'static str>,
        attempts: AtomicUsize,
    }

    impl FaultyStore {
        fn trip(&self, rule: Option<&str>, key: &ArtifactKey) -> Result<(), StoreError> {
            if rule == Some(key.task_id.as_str()) {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Other("bucket unavailable".into()));
            }
            Ok(())
        }
    }

    impl ArtifactStore for FaultyStore {
        fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
            self.trip(self.exists_fails, key)?;
            self.inner.exists(key)
        }

        fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
            self.trip(self.read_fails, key)?;
            self.inner.read(key)
        }

        fn commit(&self, key: &ArtifactKey, payload: &[u8]) -> Result<(), StoreError> {
            self.trip(self.commit_fails, key)?;
            self.inner.commit(key, payload)
        }
    }

    #[tokio::test]
    async fn test_commit_failure_is_retried_then_failed() {
        let store = Arc::new(FaultyStore {
            commit_fails: Some("aggregate"),
            ..Default::default()
        });
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let engine = Engine::new(store.clone()).with_config(config().with_retry(retry));
        let calls = Arc::new(AtomicUsize::new(0));

        let report = engine.run(pipeline("1.0", &calls)).await.unwrap();
        assert_eq!(report.state("stream"), Some(NodeState::Completed));
        assert_eq!(report.state("aggregate"), Some(NodeState::Failed));
        assert_eq!(report.state("top10"), Some(NodeState::Blocked));
        assert!(matches!(
            report.node("aggregate").unwrap().failure,
            Some(Failure::Store { .. })
        ));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_existence_check_failure_blocks_dependents() {
        let store = Arc::new(FaultyStore {
            exists_fails: Some("stream"),
            ..Default::default()
        });
        let engine = Engine::new(store.clone()).with_config(config());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = pipeline("1.0", &calls);
        tasks.push(Task::new(
            TaskDescriptor::new("island", "1"),
            |_: &TaskContext| -> anyhow::Result<Vec<u8>> { Ok(b"i".to_vec()) },
        ));

        let report = engine.run(tasks).await.unwrap();
        assert_eq!(report.state("stream"), Some(NodeState::Failed));
        assert!(matches!(
            report.node("stream").unwrap().failure,
            Some(Failure::Store { ref message }) if message.contains("bucket unavailable")
        ));
        for id in ["aggregate", "top10"] {
            assert_eq!(report.state(id), Some(NodeState::Blocked), "{}", id);
            assert_eq!(report.root_cause(id), Some("stream"));
        }
        assert_eq!(report.state("island"), Some(NodeState::Completed));
        // Nothing in the failed lineage ran
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_input_read_failure_fails_the_reader() {
        let store = Arc::new(FaultyStore {
            read_fails: Some("stream"),
            ..Default::default()
        });
        let engine = Engine::new(store.clone()).with_config(config());
        let calls = Arc::new(AtomicUsize::new(0));

        // stream is already stored, so it is skipped and must be read back
        let descriptors: Vec<_> = pipeline("1.0", &calls)
            .into_iter()
            .map(|t| t.descriptor)
            .collect();
        let (_, resolution) = engine.resolve(descriptors).unwrap();
        let stream = ArtifactKey::new("stream", resolution.hash("stream").unwrap());
        store.inner.commit(&stream, b"stream;").unwrap();

        let report = engine.run(pipeline("1.0", &calls)).await.unwrap();
        assert_eq!(report.state("stream"), Some(NodeState::Skipped));
        assert_eq!(report.state("aggregate"), Some(NodeState::Failed));
        assert!(matches!(
            report.node("aggregate").unwrap().failure,
            Some(Failure::Store { .. })
        ));
        assert_eq!(report.state("top10"), Some(NodeState::Blocked));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reset_cancel_allows_later_builds() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store).with_config(config());
        let calls = Arc::new(AtomicUsize::new(0));

        engine.cancel_token().cancel();
        let cancelled = engine.run(pipeline("1.0", &calls)).await.unwrap();
        assert!(cancelled.cancelled);
        assert_eq!(cancelled.state("stream"), Some(NodeState::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        engine.reset_cancel();
        let report = engine.run(pipeline("1.0", &calls)).await.unwrap();
        assert!(report.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_builds_share_one_execution() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::new(store).with_config(config()));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = || {
            let calls = Arc::clone(&calls);
            Task::new(
                TaskDescriptor::new("model", "1.0").param("c", 100.0),
                move |_: &TaskContext| -> anyhow::Result<Vec<u8>> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(b"weights".to_vec())
                },
            )
        };

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            let task = slow();
            async move { engine.run(vec![task]).await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            let task = slow();
            async move { engine.run(vec![task]).await }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let states = [a.state("model"), b.state("model")];
        assert!(states.iter().all(|s| *s == Some(NodeState::Completed)));
        let shared = [a.node("model").unwrap().shared, b.node("model").unwrap().shared];
        assert_eq!(shared.iter().filter(|s| **s).count(), 1);
    }
}
