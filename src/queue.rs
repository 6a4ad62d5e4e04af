//! Single-worker task dispatcher.
//!
//! All engine mutations are serialized through one long-lived worker thread
//! fed by a bounded priority queue. Submitters run on their own threads and
//! interact only by enqueueing typed tasks and awaiting oneshot completion
//! handles; the worker suspends only between tasks and at the yield points
//! inside a split analysis pass.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::{AnalysisPlan, CancelToken, Engine, QueryOptions};
use crate::error::{Error, Result};
use crate::merge::QueryResults;

/// Task priorities; lower runs earlier. Equal priorities are FIFO.
pub const PRIORITY_QUERY: u8 = 0;
pub const PRIORITY_STATS: u8 = 0;
pub const PRIORITY_ANALYZE_CHUNK: u8 = 5;
pub const PRIORITY_MAINTENANCE: u8 = 9;

/// Bound on pending submissions; beyond it submitters get `Overloaded`.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Idle time after which a maintenance task is synthesized.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(10);

/// Files processed per analyze-chunk task before yielding back to the
/// queue, so pending queries preempt a long pass.
const ANALYZE_FILES_PER_STEP: usize = 4;

/// Builds a fresh engine on reload. The facade decides what goes in here
/// (production: git CLI + registry embedder; tests: in-memory parts).
pub type EngineFactory = Box<dyn FnMut(AppConfig) -> Result<Engine> + Send>;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub chunks_analyzed: usize,
    pub total_files: usize,
    pub queue_depth: usize,
    pub last_analyzed_at_unix: Option<i64>,
    /// True when the cached repo state hash no longer matches HEAD.
    pub stale: bool,
}

pub enum Task {
    Query {
        text: String,
        options: QueryOptions,
        respond: oneshot::Sender<Result<QueryResults>>,
    },
    Stats {
        respond: oneshot::Sender<Result<StatusReport>>,
    },
    AnalyzeChunk,
    Maintenance,
    Reload {
        config: AppConfig,
        respond: oneshot::Sender<Result<()>>,
    },
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Task::Query { .. } => "query",
            Task::Stats { .. } => "get_stats",
            Task::AnalyzeChunk => "analyze_chunk",
            Task::Maintenance => "maintenance",
            Task::Reload { .. } => "reload",
        }
    }

    /// Resolve the completion handle without running the task.
    fn reject(self, err: Error) {
        match self {
            Task::Query { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Task::Stats { respond } => {
                let _ = respond.send(Err(err));
            }
            Task::Reload { respond, .. } => {
                let _ = respond.send(Err(err));
            }
            Task::AnalyzeChunk | Task::Maintenance => {}
        }
    }
}

struct Submission {
    priority: u8,
    seq: u64,
    id: Uuid,
    deadline: Option<Instant>,
    cancel: CancelToken,
    task: Task,
}

impl PartialEq for Submission {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Submission {}

impl PartialOrd for Submission {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Submission {
    /// Reversed so the max-heap pops the lowest (priority, seq) first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<Submission>,
    seq: u64,
    closed: bool,
}

enum Popped {
    Task(Submission),
    Idle,
    Closed,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a task; fails with `Overloaded` at capacity and `Cancelled`
    /// after close.
    pub fn submit(
        &self,
        priority: u8,
        deadline: Option<Instant>,
        cancel: CancelToken,
        task: Task,
    ) -> Result<Uuid> {
        let mut state = self.state.lock();
        if state.closed {
            task.reject(Error::Cancelled);
            return Err(Error::Cancelled);
        }
        if state.heap.len() >= self.capacity {
            debug!("Queue at capacity ({}), rejecting {}", self.capacity, task.name());
            task.reject(Error::Overloaded);
            return Err(Error::Overloaded);
        }
        let id = Uuid::new_v4();
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Submission {
            priority,
            seq,
            id,
            deadline,
            cancel,
            task,
        });
        drop(state);
        self.available.notify_one();
        Ok(id)
    }

    pub fn depth(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Stop accepting submissions. Already-queued tasks still drain.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    fn pop_or_idle(&self, idle: Duration) -> Popped {
        let mut state = self.state.lock();
        loop {
            if let Some(submission) = state.heap.pop() {
                return Popped::Task(submission);
            }
            if state.closed {
                return Popped::Closed;
            }
            let timed_out = self
                .available
                .wait_for(&mut state, idle)
                .timed_out();
            if timed_out && state.heap.is_empty() && !state.closed {
                return Popped::Idle;
            }
        }
    }
}

/// One-shot completion handle. Resolves with the task's result, or
/// `Cancelled` if the worker went away first.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    pub id: Uuid,
}

impl<T> TaskHandle<T> {
    fn new(rx: oneshot::Receiver<Result<T>>, id: Uuid) -> Self {
        Self { rx, id }
    }

    pub async fn wait(self) -> Result<T> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Synchronous wait for non-async callers (tests, CLI glue).
    pub fn wait_blocking(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Cancelled))
    }
}

pub fn query_handle(
    queue: &TaskQueue,
    text: String,
    options: QueryOptions,
    deadline: Option<Instant>,
    cancel: CancelToken,
) -> Result<TaskHandle<QueryResults>> {
    let (tx, rx) = oneshot::channel();
    let id = queue.submit(
        PRIORITY_QUERY,
        deadline,
        cancel,
        Task::Query {
            text,
            options,
            respond: tx,
        },
    )?;
    Ok(TaskHandle::new(rx, id))
}

pub fn stats_handle(queue: &TaskQueue) -> Result<TaskHandle<StatusReport>> {
    let (tx, rx) = oneshot::channel();
    let id = queue.submit(
        PRIORITY_STATS,
        None,
        CancelToken::new(),
        Task::Stats { respond: tx },
    )?;
    Ok(TaskHandle::new(rx, id))
}

pub fn reload_handle(queue: &TaskQueue, config: AppConfig) -> Result<TaskHandle<()>> {
    let (tx, rx) = oneshot::channel();
    // Maintenance priority: every query already queued drains first, so a
    // reload never cancels in-flight work.
    let id = queue.submit(
        PRIORITY_MAINTENANCE,
        None,
        CancelToken::new(),
        Task::Reload {
            config,
            respond: tx,
        },
    )?;
    Ok(TaskHandle::new(rx, id))
}

pub fn request_maintenance(queue: &TaskQueue) {
    if queue
        .submit(
            PRIORITY_MAINTENANCE,
            None,
            CancelToken::new(),
            Task::Maintenance,
        )
        .is_err()
    {
        debug!("Maintenance request dropped (queue full or closed)");
    }
}

/// Spawn the engine worker. Returns the join handle; close the queue to
/// stop it. The worker persists engine state before exiting.
pub fn spawn_worker(
    engine: Engine,
    queue: Arc<TaskQueue>,
    factory: EngineFactory,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("seagoat-engine".to_string())
        .spawn(move || worker_loop(engine, queue, factory))
        .expect("failed to spawn engine worker thread")
}

fn worker_loop(mut engine: Engine, queue: Arc<TaskQueue>, mut factory: EngineFactory) {
    // In-progress split analysis pass, if any.
    let mut plan: Option<AnalysisPlan> = None;

    loop {
        match queue.pop_or_idle(IDLE_INTERVAL) {
            Popped::Closed => break,
            Popped::Idle => {
                run_maintenance(&mut engine, &mut plan, &queue);
            }
            Popped::Task(submission) => {
                if submission
                    .deadline
                    .is_some_and(|deadline| Instant::now() >= deadline)
                {
                    debug!("Task {} {} expired before execution", submission.task.name(), submission.id);
                    submission.task.reject(Error::Cancelled);
                    continue;
                }
                if submission.cancel.is_cancelled() {
                    submission.task.reject(Error::Cancelled);
                    continue;
                }
                execute(
                    submission.task,
                    &submission.cancel,
                    &mut engine,
                    &mut plan,
                    &queue,
                    &mut factory,
                );
            }
        }
    }

    if let Err(e) = engine.persist() {
        warn!("Failed to persist engine state on shutdown: {}", e);
    }
    debug!("Engine worker stopped");
}

fn execute(
    task: Task,
    cancel: &CancelToken,
    engine: &mut Engine,
    plan: &mut Option<AnalysisPlan>,
    queue: &Arc<TaskQueue>,
    factory: &mut EngineFactory,
) {
    match task {
        Task::Query {
            text,
            options,
            respond,
        } => {
            let _ = respond.send(engine.query(&text, &options));
        }
        Task::Stats { respond } => {
            let stats = engine.get_stats();
            let report = StatusReport {
                chunks_analyzed: stats.chunks_analyzed,
                total_files: stats.total_files,
                queue_depth: queue.depth(),
                last_analyzed_at_unix: stats.last_analyzed_at_unix,
                stale: engine.is_stale(),
            };
            let _ = respond.send(Ok(report));
        }
        Task::AnalyzeChunk => {
            run_analyze_chunk(engine, plan, queue, cancel);
        }
        Task::Maintenance => {
            run_maintenance(engine, plan, queue);
        }
        Task::Reload { config, respond } => {
            info!("Reloading engine with new configuration");
            if let Err(e) = engine.persist() {
                warn!("Persist before reload failed: {}", e);
            }
            match factory(config) {
                Ok(new_engine) => {
                    *engine = new_engine;
                    *plan = None;
                    let _ = respond.send(Ok(()));
                }
                Err(e) => {
                    warn!("Reload failed, keeping previous engine: {}", e);
                    let _ = respond.send(Err(e));
                }
            }
        }
    }
}

/// Maintenance: check the repo state hash; when it moved, open a plan and
/// split the pass into analyze-chunk tasks so queries are not starved.
fn run_maintenance(engine: &mut Engine, plan: &mut Option<AnalysisPlan>, queue: &Arc<TaskQueue>) {
    if plan.is_some() {
        // A pass is already underway; keep it moving.
        enqueue_analyze_chunk(queue);
        return;
    }
    match engine.begin_analysis() {
        Ok(None) => {}
        Ok(Some(new_plan)) => {
            *plan = Some(new_plan);
            enqueue_analyze_chunk(queue);
        }
        Err(e) => warn!("Maintenance scan failed: {}", e),
    }
}

fn run_analyze_chunk(
    engine: &mut Engine,
    plan: &mut Option<AnalysisPlan>,
    queue: &Arc<TaskQueue>,
    cancel: &CancelToken,
) {
    let Some(active) = plan.as_mut() else {
        return;
    };
    match engine.analyze_step(active, ANALYZE_FILES_PER_STEP, cancel) {
        Ok(true) => {
            *plan = None;
        }
        Ok(false) => {
            debug!("Analysis yielding, {} files remaining", active.remaining_files());
            enqueue_analyze_chunk(queue);
        }
        Err(Error::Cancelled) => {
            // Abandon the pass; the next maintenance tick resumes from the
            // repo state, not from this plan.
            *plan = None;
        }
        Err(e) => {
            warn!("Analysis step failed: {}", e);
            *plan = None;
        }
    }
}

fn enqueue_analyze_chunk(queue: &Arc<TaskQueue>) {
    if queue
        .submit(
            PRIORITY_ANALYZE_CHUNK,
            None,
            CancelToken::new(),
            Task::AnalyzeChunk,
        )
        .is_err()
    {
        // Queue full: the pass stalls until the next maintenance tick.
        warn!("Could not re-enqueue analysis step; deferring to next maintenance");
    }
}
