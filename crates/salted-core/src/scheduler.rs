//! Parallel Scheduler - dependency-aware execution of stale nodes
//!
//! Features:
//! - One coordinator owns every node state; workers only report back over mpsc
//! - Semaphore for concurrency control
//! - Failure isolation: a failed node blocks its dependents, siblings keep going
//! - At most one execution per artifact key, shared by concurrent builds
//! - Cancellation stops dispatch; running tasks finish

use crate::config::{BuildConfig, RetryPolicy};
use crate::descriptor::TaskDescriptor;
use crate::encoder::EncodingError;
use crate::graph::TaskGraph;
use crate::hasher::ContentHash;
use crate::report::{BuildReport, Failure, NodeReport, NodeState};
use crate::resolver::Resolution;
use crate::staleness::{Freshness, StalenessPlan};
use crate::store::{with_retry, ArtifactKey, ArtifactStore, StoreError};
use crate::task::{Input, TaskContext, TaskLogic};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Committed payload or the reason there is none
pub type Outcome = Result<Arc<Vec<u8>>, Failure>;

/// Artifact keys currently being computed
///
/// The first caller for a key runs the work; later callers wait for the same
/// outcome instead of executing again.
#[derive(Default)]
pub struct InFlight {
    cells: Mutex<HashMap<ArtifactKey, Arc<OnceCell<Outcome>>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the outcome and whether it was produced by another caller
    pub async fn run<F>(&self, key: &ArtifactKey, work: F) -> (Outcome, bool)
    where
        F: Future<Output = Outcome>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cells.entry(key.clone()).or_default())
        };

        let mut ran = false;
        let outcome = cell
            .get_or_init(|| {
                ran = true;
                work
            })
            .await
            .clone();

        if ran {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            if cells.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                cells.remove(key);
            }
        }

        (outcome, !ran)
    }

    /// Keys executing right now
    pub fn len(&self) -> usize {
        self.cells.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-node bookkeeping, owned by the coordinator
struct Slot {
    descriptor: TaskDescriptor,
    /// None when the node could not be hashed
    content_hash: Option<ContentHash>,
    state: NodeState,
    failure: Option<Failure>,
    shared: bool,
    duration: Duration,
    /// Declared order, duplicates kept
    deps: Vec<usize>,
    /// Distinct
    dependents: Vec<usize>,
    /// Distinct dependencies not yet available
    waiting_on: usize,
    /// Dependents that have not yet taken this node's payload
    consumers_left: usize,
}

impl Slot {
    fn key(&self) -> Option<ArtifactKey> {
        self.content_hash
            .map(|hash| ArtifactKey::new(self.descriptor.task_id.clone(), hash))
    }
}

/// Where a node starts before anything runs
enum Start<'a> {
    Planned(&'a Freshness),
    Unhashable(&'a EncodingError),
    /// Waits to be blocked by the upstream node that failed to encode
    Unresolved,
}

/// Node-state map, ready queue and produced payloads for one run
struct Board {
    slots: Vec<Slot>,
    ready: VecDeque<usize>,
    produced: HashMap<usize, Arc<Vec<u8>>>,
}

impl Board {
    fn new(graph: &TaskGraph, resolution: &Resolution, plan: &StalenessPlan) -> Self {
        let mut slots: Vec<Slot> = Vec::with_capacity(graph.len());
        let mut position: HashMap<&str, usize> = HashMap::with_capacity(graph.len());
        let mut starts = Vec::with_capacity(graph.len());

        for descriptor in graph.topological_order() {
            let task_id = descriptor.task_id.as_str();
            let start = match (plan.status(task_id), resolution.error(task_id)) {
                (Some(status), _) => Start::Planned(status),
                (None, Some(error)) => Start::Unhashable(error),
                (None, None) => Start::Unresolved,
            };
            let deps: Vec<usize> = descriptor
                .dependencies
                .iter()
                .filter_map(|d| position.get(d.as_str()).copied())
                .collect();

            let pos = slots.len();
            let distinct: HashSet<usize> = deps.iter().copied().collect();
            for &d in &distinct {
                slots[d].dependents.push(pos);
                slots[d].consumers_left += 1;
            }

            position.insert(task_id, pos);
            starts.push(start);
            slots.push(Slot {
                descriptor: descriptor.clone(),
                content_hash: resolution.hash(task_id),
                state: NodeState::Pending,
                failure: None,
                shared: false,
                duration: Duration::ZERO,
                deps,
                dependents: Vec::new(),
                waiting_on: distinct.len(),
                consumers_left: 0,
            });
        }

        let mut board = Self {
            slots,
            ready: VecDeque::new(),
            produced: HashMap::new(),
        };

        for (pos, start) in starts.into_iter().enumerate() {
            if board.slots[pos].state != NodeState::Pending {
                continue;
            }
            match start {
                Start::Planned(Freshness::Fresh) => {
                    board.slots[pos].state = NodeState::Skipped;
                    for d in board.slots[pos].dependents.clone() {
                        board.slots[d].waiting_on -= 1;
                    }
                }
                Start::Planned(Freshness::Unknown { error }) => {
                    board.fail(pos, Failure::Store { message: error.clone() }, Duration::ZERO);
                }
                Start::Planned(Freshness::Stale(_)) => {
                    if board.slots[pos].waiting_on == 0 {
                        board.ready.push_back(pos);
                    }
                }
                Start::Unhashable(error) => {
                    board.fail(pos, Failure::Encoding { message: error.to_string() }, Duration::ZERO);
                }
                Start::Unresolved => {}
            }
        }

        board
    }

    /// Detach what a worker needs; None if the node has no key
    fn job(&self, pos: usize, logic: &HashMap<String, Arc<dyn TaskLogic>>) -> Option<Job> {
        let slot = &self.slots[pos];
        let inputs = slot
            .deps
            .iter()
            .map(|&d| {
                self.slots[d]
                    .key()
                    .map(|key| (key, self.produced.get(&d).cloned()))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Job {
            key: slot.key()?,
            descriptor: slot.descriptor.clone(),
            inputs,
            logic: logic.get(&slot.descriptor.task_id).cloned(),
        })
    }

    fn complete(&mut self, pos: usize, payload: Arc<Vec<u8>>, shared: bool, duration: Duration) {
        let slot = &mut self.slots[pos];
        slot.state = NodeState::Completed;
        slot.shared = shared;
        slot.duration = duration;
        tracing::debug!("{} completed in {:?}", slot.descriptor.task_id, duration);

        if slot.consumers_left > 0 {
            self.produced.insert(pos, payload);
        }
        for d in self.slots[pos].dependents.clone() {
            let dependent = &mut self.slots[d];
            dependent.waiting_on = dependent.waiting_on.saturating_sub(1);
            if dependent.waiting_on == 0 && dependent.state == NodeState::Pending {
                self.ready.push_back(d);
            }
        }
    }

    fn fail(&mut self, pos: usize, failure: Failure, duration: Duration) {
        let slot = &mut self.slots[pos];
        tracing::warn!("{} failed: {}", slot.descriptor.task_id, failure);
        slot.state = NodeState::Failed;
        slot.failure = Some(failure);
        slot.duration = duration;
        self.block_dependents(pos);
    }

    /// Mark every pending transitive dependent as blocked by `root`
    fn block_dependents(&mut self, root: usize) {
        let root_id = self.slots[root].descriptor.task_id.clone();
        let mut queue = VecDeque::from([(root, vec![root_id.clone()])]);

        while let Some((pos, chain)) = queue.pop_front() {
            for d in self.slots[pos].dependents.clone() {
                if self.slots[d].state != NodeState::Pending {
                    continue;
                }
                self.slots[d].state = NodeState::Blocked;
                self.slots[d].failure = Some(Failure::Blocked {
                    root: root_id.clone(),
                    chain: chain.clone(),
                });
                self.release_inputs(d);
                tracing::debug!("{} blocked by {}", self.slots[d].descriptor.task_id, root_id);

                let mut next = chain.clone();
                next.push(self.slots[d].descriptor.task_id.clone());
                queue.push_back((d, next));
            }
        }
    }

    /// `pos` no longer needs its dependencies' payloads
    fn release_inputs(&mut self, pos: usize) {
        let distinct: HashSet<usize> = self.slots[pos].deps.iter().copied().collect();
        for d in distinct {
            let dep = &mut self.slots[d];
            dep.consumers_left = dep.consumers_left.saturating_sub(1);
            if dep.consumers_left == 0 {
                self.produced.remove(&d);
            }
        }
    }

    fn into_report(self, started: Instant, cancelled: bool) -> BuildReport {
        let nodes = self
            .slots
            .into_iter()
            .map(|slot| NodeReport {
                task_id: slot.descriptor.task_id,
                content_hash: slot.content_hash,
                state: match slot.state {
                    NodeState::Pending | NodeState::Running => NodeState::Cancelled,
                    state => state,
                },
                duration_ms: slot.duration.as_millis() as u64,
                shared: slot.shared,
                failure: slot.failure,
            })
            .collect();

        BuildReport {
            nodes,
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled,
        }
    }
}

/// Everything a worker needs, detached from the board
struct Job {
    key: ArtifactKey,
    descriptor: TaskDescriptor,
    /// Declared order; payload present when produced earlier in this run
    inputs: Vec<(ArtifactKey, Option<Arc<Vec<u8>>>)>,
    logic: Option<Arc<dyn TaskLogic>>,
}

struct Finished {
    pos: usize,
    outcome: Outcome,
    shared: bool,
    duration: Duration,
}

/// Runs the stale part of a plan
pub struct Scheduler {
    store: Arc<dyn ArtifactStore>,
    config: BuildConfig,
    in_flight: Arc<InFlight>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ArtifactStore>, config: BuildConfig) -> Self {
        Self {
            store,
            config,
            in_flight: Arc::new(InFlight::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Share de-duplication with other schedulers
    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute every stale node of `plan`; never fails as a whole
    pub async fn run(
        &self,
        graph: &TaskGraph,
        resolution: &Resolution,
        plan: &StalenessPlan,
        logic: &HashMap<String, Arc<dyn TaskLogic>>,
    ) -> BuildReport {
        let started = Instant::now();
        let mut board = Board::new(graph, resolution, plan);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<Finished>(board.slots.len().max(1));

        let mut running = 0usize;
        let mut cancelled = false;

        loop {
            cancelled = cancelled || self.cancel.is_cancelled();

            if !cancelled {
                while let Some(&pos) = board.ready.front() {
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    board.ready.pop_front();
                    match board.job(pos, logic) {
                        Some(job) => {
                            self.dispatch(&mut board, pos, job, permit, tx.clone());
                            running += 1;
                        }
                        None => {
                            let failure = Failure::Encoding {
                                message: "content hash unresolved".into(),
                            };
                            board.fail(pos, failure, Duration::ZERO);
                        }
                    }
                }
            }

            if running == 0 {
                break;
            }

            tokio::select! {
                finished = rx.recv() => {
                    let Some(finished) = finished else { break };
                    running -= 1;
                    match finished.outcome {
                        Ok(payload) => board.complete(finished.pos, payload, finished.shared, finished.duration),
                        Err(failure) => board.fail(finished.pos, failure, finished.duration),
                    }
                }
                _ = self.cancel.cancelled(), if !cancelled => {
                    tracing::warn!("Build cancelled; waiting for {} running tasks", running);
                    cancelled = true;
                }
            }
        }

        let report = board.into_report(started, cancelled);
        tracing::info!(
            "Scheduler finished {} nodes in {:?}: {}",
            report.nodes.len(),
            started.elapsed(),
            report.summary()
        );
        report
    }

    fn dispatch(
        &self,
        board: &mut Board,
        pos: usize,
        job: Job,
        permit: OwnedSemaphorePermit,
        tx: mpsc::Sender<Finished>,
    ) {
        tracing::debug!("Dispatching {}", job.key);
        board.slots[pos].state = NodeState::Running;
        board.release_inputs(pos);

        let in_flight = Arc::clone(&self.in_flight);
        let store = Arc::clone(&self.store);
        let retry = self.config.retry.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let key = job.key.clone();
            let (outcome, shared) = in_flight.run(&key, execute(job, store, retry)).await;
            drop(permit);

            let _ = tx
                .send(Finished {
                    pos,
                    outcome,
                    shared,
                    duration: start.elapsed(),
                })
                .await;
        });
    }
}

async fn execute(job: Job, store: Arc<dyn ArtifactStore>, retry: RetryPolicy) -> Outcome {
    match tokio::task::spawn_blocking(move || execute_blocking(job, store.as_ref(), &retry)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(Failure::Execution {
            message: format!("task panicked: {}", e),
        }),
    }
}

/// Read inputs, run the logic, commit the payload
fn execute_blocking(job: Job, store: &dyn ArtifactStore, retry: &RetryPolicy) -> Outcome {
    let Some(logic) = job.logic else {
        return Err(Failure::Execution {
            message: format!("no logic registered for task `{}`", job.key.task_id),
        });
    };

    let mut inputs = Vec::with_capacity(job.inputs.len());
    for (key, produced) in job.inputs {
        let payload = match produced {
            Some(payload) => payload,
            None => Arc::new(with_retry(retry, "read", || store.read(&key)).map_err(store_failure)?),
        };
        inputs.push(Input {
            task_id: key.task_id,
            content_hash: key.content_hash,
            payload,
        });
    }

    let ctx = TaskContext {
        descriptor: job.descriptor,
        content_hash: job.key.content_hash,
        inputs,
    };
    let payload = logic.execute(&ctx).map_err(|e| Failure::Execution {
        message: format!("{:#}", e),
    })?;

    with_retry(retry, "commit", || store.commit(&job.key, &payload)).map_err(store_failure)?;
    Ok(Arc::new(payload))
}

fn store_failure(e: StoreError) -> Failure {
    Failure::Store {
        message: e.to_string(),
    }
}
