use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::SourceAggregator;
use crate::cache::RequestCache;
use crate::cancel::{CancelReason, CancelToken};
use crate::config::EngineConfig;
use crate::error::AnalysisError;
use crate::model::{AnalysisMode, AnalysisRequest, StorageBreakdown};

pub type AnalysisResult = Result<Arc<StorageBreakdown>, AnalysisError>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::TimedOut,
            4 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::TimedOut => 3,
            Self::Cancelled => 4,
            Self::Failed => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TaskKey {
    key: String,
    mode: AnalysisMode,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActiveTaskSnapshot {
    pub key: String,
    pub mode: AnalysisMode,
    pub state: TaskState,
}

#[derive(Debug)]
struct ActiveTask {
    id: Uuid,
    key: String,
    timeout: Duration,
    cancel: CancelToken,
    state: AtomicU8,
    waiters: Mutex<Vec<(u64, Sender<AnalysisResult>)>>,
}

impl ActiveTask {
    fn new(key: &str, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.to_string(),
            timeout,
            cancel: CancelToken::new(),
            state: AtomicU8::new(TaskState::Pending.as_u8()),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn add_waiter(&self, waiter: u64, sender: Sender<AnalysisResult>) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((waiter, sender));
    }

    fn remove_waiter(&self, waiter: u64) -> bool {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|(id, _)| *id != waiter);
        waiters.is_empty()
    }

    fn notify(&self, result: &AnalysisResult) {
        let waiters = std::mem::take(
            &mut *self.waiters.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (_, sender) in waiters {
            // A waiter that gave up has dropped its receiver.
            let _ = sender.send(result.clone());
        }
    }

    fn interrupted_error(&self) -> AnalysisError {
        match self.cancel.reason() {
            Some(CancelReason::TimedOut) => AnalysisError::Timeout {
                key: self.key.clone(),
                after: self.timeout,
            },
            _ => AnalysisError::Cancelled {
                key: self.key.clone(),
            },
        }
    }
}

struct Shared {
    aggregator: SourceAggregator,
    cache: RequestCache,
    active: DashMap<TaskKey, Arc<ActiveTask>>,
    default_timeout: Duration,
    next_waiter: AtomicU64,
    shut_down: AtomicBool,
}

enum Claim {
    Cached(Arc<StorageBreakdown>),
    Joined(Arc<ActiveTask>),
    Started(Arc<ActiveTask>),
}

impl Shared {
    fn cached(&self, request: &AnalysisRequest) -> Option<Arc<StorageBreakdown>> {
        if request.force_refresh {
            return None;
        }
        self.cache
            .get(&request.key)
            .filter(|hit| mode_satisfies(hit.mode(), request.mode))
    }

    // Joins the in-flight task for `task_key` or registers a new one.
    // Tasks publish to the cache before leaving the registry, so a vacant
    // entry is checked against the cache once more under the entry lock.
    fn claim(
        &self,
        request: &AnalysisRequest,
        task_key: &TaskKey,
        timeout: Duration,
        waiter: u64,
        sender: Sender<AnalysisResult>,
    ) -> Claim {
        match self.active.entry(task_key.clone()) {
            Entry::Occupied(entry) => {
                let task = Arc::clone(entry.get());
                task.add_waiter(waiter, sender);
                debug!(key = %task.key, task = %task.id, "joining in-flight analysis");
                Claim::Joined(task)
            }
            Entry::Vacant(entry) => {
                if let Some(hit) = self.cached(request) {
                    return Claim::Cached(hit);
                }
                let task = Arc::new(ActiveTask::new(&request.key, timeout));
                task.add_waiter(waiter, sender);
                entry.insert(Arc::clone(&task));
                Claim::Started(task)
            }
        }
    }
}

/// Cache-fronted, single-flight scheduler running analyses on a bounded
/// worker pool. Owned by the caller and passed by reference; there is no
/// process-wide instance.
pub struct Scheduler {
    shared: Arc<Shared>,
    pool: Mutex<Option<rayon::ThreadPool>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cached", &self.shared.cache.len())
            .field("active", &self.shared.active.len())
            .field("shut_down", &self.shared.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl Scheduler {
    pub fn new(aggregator: SourceAggregator, config: &EngineConfig) -> Result<Self> {
        config.validate().context("invalid engine config")?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|index| format!("footprint-worker-{index}"))
            .build()
            .context("failed to build analysis worker pool")?;

        Ok(Self {
            shared: Arc::new(Shared {
                aggregator,
                cache: RequestCache::new(config.cache_ttl(), config.cache_capacity),
                active: DashMap::new(),
                default_timeout: config.default_timeout(),
                next_waiter: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
            pool: Mutex::new(Some(pool)),
        })
    }

    pub fn get_or_compute(&self, request: AnalysisRequest) -> AnalysisResult {
        self.submit(request).wait()
    }

    pub fn submit(&self, request: AnalysisRequest) -> AnalysisHandle {
        let timeout = request.timeout.unwrap_or(self.shared.default_timeout);
        let ready = |result| AnalysisHandle {
            key: request.key.clone(),
            timeout,
            started: Instant::now(),
            state: HandleState::Ready(result),
        };

        if self.shared.shut_down.load(Ordering::Acquire) {
            return ready(Err(AnalysisError::ShutDown));
        }

        if let Some(hit) = self.shared.cached(&request) {
            debug!(key = %request.key, "cache hit");
            return ready(Ok(hit));
        }

        let task_key = TaskKey {
            key: request.key.clone(),
            mode: request.mode,
        };
        let (sender, receiver) = mpsc::channel();
        let waiter = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);

        let task = match self
            .shared
            .claim(&request, &task_key, timeout, waiter, sender)
        {
            Claim::Cached(hit) => {
                debug!(key = %request.key, "cache hit after registry check");
                return ready(Ok(hit));
            }
            Claim::Joined(task) => task,
            Claim::Started(task) => {
                self.spawn(task_key.clone(), Arc::clone(&task), request.mode);
                task
            }
        };

        AnalysisHandle {
            key: request.key.clone(),
            timeout,
            started: Instant::now(),
            state: HandleState::Waiting {
                shared: Arc::clone(&self.shared),
                task_key,
                task,
                waiter,
                receiver,
            },
        }
    }

    fn spawn(&self, task_key: TaskKey, task: Arc<ActiveTask>, mode: AnalysisMode) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pool) = pool.as_ref() else {
            self.shared.active.remove_if(&task_key, |_, t| t.id == task.id);
            task.set_state(TaskState::Cancelled);
            task.notify(&Err(AnalysisError::ShutDown));
            return;
        };

        info!(key = %task.key, task = %task.id, ?mode, "analysis scheduled");
        let shared = Arc::clone(&self.shared);
        pool.spawn(move || run_task(&shared, &task_key, &task, mode));
    }

    pub fn cancel(&self, key: &str) {
        let matching = self
            .shared
            .active
            .iter()
            .filter(|entry| entry.key().key == key)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        for task_key in matching {
            cancel_task(&self.shared, &task_key);
        }
    }

    pub fn cancel_all(&self) {
        let all = self
            .shared
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        for task_key in all {
            cancel_task(&self.shared, &task_key);
        }
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.shared.cache.len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.shared.active.iter().any(|entry| entry.key().key == key)
    }

    pub fn active_tasks(&self) -> Vec<ActiveTaskSnapshot> {
        let mut tasks = self
            .shared
            .active
            .iter()
            .map(|entry| ActiveTaskSnapshot {
                key: entry.key().key.clone(),
                mode: entry.key().mode,
                state: entry.value().state(),
            })
            .collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        tasks
    }

    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduler shutting down");
        self.cancel_all();
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(pool);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// A Basic request is answered by a Detailed result, not the other way round.
fn mode_satisfies(have: AnalysisMode, want: AnalysisMode) -> bool {
    have == want || have == AnalysisMode::Detailed
}

fn cancel_task(shared: &Shared, task_key: &TaskKey) {
    if let Some((_, task)) = shared.active.remove(task_key) {
        task.cancel.cancel(CancelReason::Cancelled);
        task.set_state(TaskState::Cancelled);
        info!(key = %task.key, task = %task.id, "analysis cancelled");
        task.notify(&Err(task.interrupted_error()));
    }
}

fn run_task(shared: &Shared, task_key: &TaskKey, task: &ActiveTask, mode: AnalysisMode) {
    let result: AnalysisResult = if task.cancel.is_cancelled() {
        Err(task.interrupted_error())
    } else {
        task.set_state(TaskState::Running);
        let started = Instant::now();
        let is_cancelled = || task.cancel.is_cancelled();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            shared.aggregator.analyze(&task.key, mode, &is_cancelled)
        }));

        let result = match outcome {
            Ok(_) if task.cancel.is_cancelled() => Err(task.interrupted_error()),
            Ok(Ok(breakdown)) => Ok(Arc::new(breakdown)),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(AnalysisError::Failed {
                key: task.key.clone(),
                reason: format!("analysis panicked: {}", panic_message(panic.as_ref())),
            }),
        };
        debug!(
            key = %task.key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "analysis finished"
        );
        result
    };

    let state = match &result {
        Ok(breakdown) => {
            shared.cache.put(&task.key, Arc::clone(breakdown));
            TaskState::Completed
        }
        Err(AnalysisError::Timeout { .. }) => TaskState::TimedOut,
        Err(AnalysisError::Cancelled { .. }) | Err(AnalysisError::ShutDown) => {
            TaskState::Cancelled
        }
        Err(err) => {
            warn!(key = %task.key, "analysis failed: {err}");
            TaskState::Failed
        }
    };

    task.set_state(state);
    shared.active.remove_if(task_key, |_, active| active.id == task.id);
    task.notify(&result);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

enum HandleState {
    Ready(AnalysisResult),
    Waiting {
        shared: Arc<Shared>,
        task_key: TaskKey,
        task: Arc<ActiveTask>,
        waiter: u64,
        receiver: Receiver<AnalysisResult>,
    },
}

pub struct AnalysisHandle {
    key: String,
    timeout: Duration,
    started: Instant,
    state: HandleState,
}

impl std::fmt::Debug for AnalysisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisHandle")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("ready", &matches!(self.state, HandleState::Ready(_)))
            .finish()
    }
}

impl AnalysisHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn wait(self) -> AnalysisResult {
        let (shared, task_key, task, waiter, receiver) = match self.state {
            HandleState::Ready(result) => return result,
            HandleState::Waiting {
                shared,
                task_key,
                task,
                waiter,
                receiver,
            } => (shared, task_key, task, waiter, receiver),
        };

        let remaining = self.timeout.saturating_sub(self.started.elapsed());
        match receiver.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::Cancelled {
                key: self.key.clone(),
            }),
            Err(RecvTimeoutError::Timeout) => {
                expire_waiter(&shared, &task_key, &task, waiter);
                // The task may have finished between the deadline and the
                // detach above.
                receiver.try_recv().unwrap_or_else(|_| {
                    Err(AnalysisError::Timeout {
                        key: self.key.clone(),
                        after: self.timeout,
                    })
                })
            }
        }
    }
}

// Detaches a timed-out waiter. The computation is interrupted and
// unregistered once its last waiter is gone.
fn expire_waiter(shared: &Shared, task_key: &TaskKey, task: &ActiveTask, waiter: u64) {
    let Entry::Occupied(entry) = shared.active.entry(task_key.clone()) else {
        return;
    };
    if entry.get().id != task.id {
        return;
    }

    if task.remove_waiter(waiter) {
        task.cancel.cancel(CancelReason::TimedOut);
        task.set_state(TaskState::TimedOut);
        entry.remove();
        warn!(key = %task.key, task = %task.id, "analysis timed out");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use super::{mode_satisfies, Claim, Scheduler, TaskKey};
    use crate::aggregate::SourceAggregator;
    use crate::config::EngineConfig;
    use crate::error::{AnalysisError, SourceError};
    use crate::model::{AnalysisMode, AnalysisRequest, DataSource, ExactStats, PackageInfo};
    use crate::providers::{PackageMetadataProvider, StorageStatsProvider};

    struct Package;

    impl PackageMetadataProvider for Package {
        fn package_info(&self, key: &str) -> Result<PackageInfo, SourceError> {
            Ok(PackageInfo {
                install_path: key.into(),
                file_size: 64,
            })
        }
    }

    struct CountingStats {
        calls: AtomicUsize,
        panic_on: Option<&'static str>,
    }

    impl StorageStatsProvider for CountingStats {
        fn query(&self, key: &str) -> Result<ExactStats, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on == Some(key) {
                panic!("stats binding crashed");
            }
            Ok(ExactStats {
                app_bytes: 100,
                data_bytes: 10,
                cache_bytes: 1,
                external_cache_bytes: 0,
            })
        }
    }

    fn scheduler(panic_on: Option<&'static str>) -> (Scheduler, Arc<CountingStats>) {
        let config = EngineConfig::default();
        let stats = Arc::new(CountingStats {
            calls: AtomicUsize::new(0),
            panic_on,
        });
        let aggregator = SourceAggregator::new(Arc::new(Package), &config)
            .with_stats(DataSource::Available(stats.clone()));
        (
            Scheduler::new(aggregator, &config).expect("scheduler"),
            stats,
        )
    }

    #[test]
    fn detailed_results_answer_basic_requests() {
        assert!(mode_satisfies(AnalysisMode::Detailed, AnalysisMode::Basic));
        assert!(mode_satisfies(AnalysisMode::Basic, AnalysisMode::Basic));
        assert!(!mode_satisfies(AnalysisMode::Basic, AnalysisMode::Detailed));
    }

    #[test]
    fn force_refresh_recomputes() {
        let (scheduler, stats) = scheduler(None);
        let request = AnalysisRequest::new("com.example", AnalysisMode::Basic);

        let first = scheduler.get_or_compute(request.clone()).expect("first");
        let second = scheduler
            .get_or_compute(request.force_refresh(true))
            .expect("second");
        assert_eq!(stats.calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.total_exact(), 111);
    }

    #[test]
    fn vacant_registry_entry_is_answered_from_cache() {
        let (scheduler, stats) = scheduler(None);
        let request = AnalysisRequest::new("com.example", AnalysisMode::Basic);
        let first = scheduler.get_or_compute(request.clone()).expect("first");

        // A caller that missed the cache just before the task published its
        // result reaches the registry after the task has left it.
        let task_key = TaskKey {
            key: "com.example".to_string(),
            mode: AnalysisMode::Basic,
        };
        let (sender, _receiver) = mpsc::channel();
        let claim = scheduler.shared.claim(
            &request,
            &task_key,
            Duration::from_secs(1),
            u64::MAX,
            sender,
        );

        assert!(matches!(claim, Claim::Cached(ref hit) if Arc::ptr_eq(hit, &first)));
        assert!(!scheduler.is_active("com.example"));
        assert_eq!(stats.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_cache_forces_recomputation() {
        let (scheduler, stats) = scheduler(None);
        let request = AnalysisRequest::new("com.example", AnalysisMode::Basic);

        scheduler.get_or_compute(request.clone()).expect("first");
        assert_eq!(scheduler.cached_len(), 1);
        scheduler.clear_cache();
        assert_eq!(scheduler.cached_len(), 0);
        scheduler.get_or_compute(request).expect("second");
        assert_eq!(stats.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panics_surface_as_failures() {
        let (scheduler, _) = scheduler(Some("com.broken"));

        let err = scheduler
            .get_or_compute(AnalysisRequest::new("com.broken", AnalysisMode::Basic))
            .expect_err("panic is caught");
        assert!(matches!(err, AnalysisError::Failed { ref reason, .. } if reason.contains("stats binding crashed")));
        assert!(!scheduler.is_active("com.broken"));

        // The pool survives the panic.
        scheduler
            .get_or_compute(AnalysisRequest::new("com.fine", AnalysisMode::Basic))
            .expect("pool still works");
    }

    #[test]
    fn shutdown_is_idempotent_and_refuses_work() {
        let (scheduler, _) = scheduler(None);
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());

        let err = scheduler
            .get_or_compute(
                AnalysisRequest::new("com.example", AnalysisMode::Basic)
                    .with_timeout(Duration::from_millis(100)),
            )
            .expect_err("shut down");
        assert_eq!(err, AnalysisError::ShutDown);
    }

    #[test]
    fn cancel_without_active_task_is_a_no_op() {
        let (scheduler, _) = scheduler(None);
        scheduler.cancel("com.idle");
        scheduler.cancel_all();
        assert!(scheduler.active_tasks().is_empty());
    }
}
